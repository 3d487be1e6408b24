//! SQLite schema.
//!
//! Migrations are append-only; `PRAGMA user_version` records how many have
//! been applied. Each one runs in its own transaction together with the
//! version bump.

use crate::error::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// `(name, sql)`; version `n` is `MIGRATIONS[n - 1]`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "collection tables",
        r#"
    CREATE TABLE IF NOT EXISTS channels (
        id                  INTEGER PRIMARY KEY,
        name                TEXT NOT NULL,
        backend             TEXT NOT NULL,
        ids_authoritative   INTEGER NOT NULL,
        title               TEXT,
        about               TEXT,
        participants        INTEGER,
        registered_at       DATETIME NOT NULL,
        updated_at          DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_channels_name ON channels(name);

    CREATE TABLE IF NOT EXISTS messages (
        channel_id       INTEGER NOT NULL REFERENCES channels(id),
        message_key      TEXT NOT NULL,
        message_id       INTEGER,
        id_provenance    TEXT NOT NULL,
        posted_at        DATETIME NOT NULL,
        text             TEXT NOT NULL,
        views            INTEGER,
        forwards         INTEGER,
        reply_count      INTEGER,
        reactions        JSON NOT NULL,
        media            JSON NOT NULL,
        forwarded_from   TEXT,
        edited_at        DATETIME,
        is_pinned        INTEGER NOT NULL DEFAULT 0,
        backend          TEXT NOT NULL,
        collected_at     DATETIME NOT NULL,

        PRIMARY KEY (channel_id, message_key)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_channel_id ON messages(channel_id, message_id);
    CREATE INDEX IF NOT EXISTS idx_messages_posted ON messages(channel_id, posted_at);

    CREATE TABLE IF NOT EXISTS checkpoints (
        channel_id          INTEGER PRIMARY KEY REFERENCES channels(id),
        channel_name        TEXT NOT NULL,
        last_message_id     INTEGER,
        messages_collected  INTEGER NOT NULL DEFAULT 0,
        batches_flushed     INTEGER NOT NULL DEFAULT 0,
        updated_at          DATETIME NOT NULL
    );
    "#,
    ),
    (
        "continuity tracking and run manifests",
        r#"
    CREATE TABLE IF NOT EXISTS message_continuity (
        channel_id       INTEGER NOT NULL,
        message_id       INTEGER NOT NULL,
        observed         INTEGER NOT NULL DEFAULT 0,
        status           TEXT NOT NULL,
        first_seen_at    DATETIME,
        last_checked_at  DATETIME NOT NULL,

        PRIMARY KEY (channel_id, message_id)
    );

    CREATE INDEX IF NOT EXISTS idx_continuity_status ON message_continuity(channel_id, status);

    -- Append-only: rows are never updated or deleted
    CREATE TABLE IF NOT EXISTS message_status_history (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        channel_id        INTEGER NOT NULL,
        message_id        INTEGER NOT NULL,
        status            TEXT NOT NULL,
        observed_at       DATETIME NOT NULL,
        content_checksum  TEXT,
        content_length    INTEGER,
        run_id            TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_history_message
        ON message_status_history(channel_id, message_id, id);

    CREATE TABLE IF NOT EXISTS scrape_runs (
        run_id         TEXT PRIMARY KEY,
        started_at     DATETIME NOT NULL,
        ended_at       DATETIME,
        backend        TEXT NOT NULL,
        manifest_json  JSON NOT NULL,
        created_at     DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_started ON scrape_runs(started_at);
    "#,
    ),
];

/// Apply every migration newer than the stored version.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied = schema_version(conn)?;
    if applied > SCHEMA_VERSION {
        tracing::warn!(
            applied,
            known = SCHEMA_VERSION,
            "Database was written by a newer chanwatch"
        );
        return Ok(());
    }

    for (version, (name, sql)) in (1..).zip(MIGRATIONS.iter()) {
        if version <= applied {
            continue;
        }
        tracing::info!(version, name, "Applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
