//! Database repository layer
//!
//! Provides query and insert operations for channels, messages and checkpoints.

use super::{parse_ts, parse_ts_opt};
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A channel as registered in the database.
#[derive(Debug, Clone)]
pub struct StoredChannel {
    pub channel: ChannelRef,
    pub backend: BackendKind,
    /// Whether ids from this channel's backend feed gap inference
    pub ids_authoritative: bool,
    pub info: ChannelInfo,
    pub registered_at: DateTime<Utc>,
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Lock the connection. A panic while holding the lock cannot leave a
    /// half-applied statement behind, so a poisoned lock is still usable.
    pub(super) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Channel operations
    // ============================================

    /// Insert or update a channel registration
    pub fn upsert_channel(
        &self,
        channel: &ChannelRef,
        backend: BackendKind,
        ids_authoritative: bool,
    ) -> Result<()> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO channels (id, name, backend, ids_authoritative, registered_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                backend = excluded.backend,
                ids_authoritative = excluded.ids_authoritative,
                updated_at = excluded.updated_at
            "#,
            params![
                channel.id,
                channel.name,
                backend.as_str(),
                ids_authoritative,
                now
            ],
        )?;
        Ok(())
    }

    /// Store descriptive metadata returned by the backend
    pub fn update_channel_info(&self, channel_id: i64, info: &ChannelInfo) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            UPDATE channels
            SET title = ?2, about = ?3, participants = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                channel_id,
                info.title,
                info.about,
                info.participants.map(|p| p as i64),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get a channel by id
    pub fn get_channel(&self, channel_id: i64) -> Result<Option<StoredChannel>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM channels WHERE id = ?",
            [channel_id],
            Self::row_to_channel,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get the most recently updated channel registered under a name
    pub fn find_channel(&self, name: &str) -> Result<Option<StoredChannel>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM channels WHERE name = ? ORDER BY updated_at DESC LIMIT 1",
            [normalize_channel_name(name)],
            Self::row_to_channel,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List all registered channels
    pub fn list_channels(&self) -> Result<Vec<StoredChannel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM channels ORDER BY name ASC")?;
        let rows = stmt
            .query_map([], Self::row_to_channel)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_channel(row: &Row) -> rusqlite::Result<StoredChannel> {
        let id: i64 = row.get("id")?;
        let name: String = row.get("name")?;
        let backend_str: String = row.get("backend")?;
        let registered_at: String = row.get("registered_at")?;
        let participants: Option<i64> = row.get("participants")?;

        Ok(StoredChannel {
            channel: ChannelRef::new(id, name.clone()),
            backend: backend_str.parse().unwrap_or_default(),
            ids_authoritative: row.get("ids_authoritative")?,
            info: ChannelInfo {
                id: Some(id),
                name,
                title: row.get("title")?,
                about: row.get("about")?,
                participants: participants.map(|p| p as u64),
            },
            registered_at: parse_ts(&registered_at),
        })
    }

    // ============================================
    // Message operations
    // ============================================

    /// Insert a batch of messages in a transaction.
    ///
    /// Records that share a store key with an existing row refresh its
    /// engagement counters and text instead of duplicating it. Returns the
    /// number of rows that did not exist before.
    pub fn insert_messages(&self, channel_id: i64, messages: &[MessageRecord]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let before: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?",
            [channel_id],
            |r| r.get(0),
        )?;

        for message in messages {
            tx.execute(
                r#"
                INSERT INTO messages (channel_id, message_key, message_id, id_provenance, posted_at,
                                      text, views, forwards, reply_count, reactions, media,
                                      forwarded_from, edited_at, is_pinned, backend, collected_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(channel_id, message_key) DO UPDATE SET
                    text = excluded.text,
                    views = excluded.views,
                    forwards = excluded.forwards,
                    reply_count = excluded.reply_count,
                    reactions = excluded.reactions,
                    edited_at = excluded.edited_at,
                    is_pinned = excluded.is_pinned,
                    collected_at = excluded.collected_at
                "#,
                params![
                    channel_id,
                    message.store_key(),
                    message.message_id,
                    message.id_provenance.as_str(),
                    message.posted_at.to_rfc3339(),
                    message.text,
                    message.views.map(|v| v as i64),
                    message.forwards.map(|v| v as i64),
                    message.reply_count.map(|v| v as i64),
                    serde_json::to_string(&message.reactions)?,
                    serde_json::to_string(&message.media)?,
                    message.forwarded_from,
                    message.edited_at.map(|t| t.to_rfc3339()),
                    message.is_pinned,
                    message.backend.as_str(),
                    message.collected_at.to_rfc3339(),
                ],
            )?;
        }

        let after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?",
            [channel_id],
            |r| r.get(0),
        )?;

        tx.commit()?;
        Ok((after - before).max(0) as usize)
    }

    /// Count stored messages for a channel
    pub fn count_messages(&self, channel_id: i64) -> Result<i64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?",
            [channel_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Get stored messages for a channel, oldest first
    pub fn get_messages(&self, channel_id: i64, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT m.*, c.name AS channel_name
            FROM messages m JOIN channels c ON c.id = m.channel_id
            WHERE m.channel_id = ?
            ORDER BY m.posted_at ASC, m.message_id ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![channel_id, limit as i64], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<MessageRecord> {
        let provenance: String = row.get("id_provenance")?;
        let backend: String = row.get("backend")?;
        let posted_at: String = row.get("posted_at")?;
        let collected_at: String = row.get("collected_at")?;
        let reactions: String = row.get("reactions")?;
        let media: String = row.get("media")?;
        let views: Option<i64> = row.get("views")?;
        let forwards: Option<i64> = row.get("forwards")?;
        let reply_count: Option<i64> = row.get("reply_count")?;

        Ok(MessageRecord {
            channel_id: row.get("channel_id")?,
            channel_name: row.get("channel_name")?,
            message_id: row.get("message_id")?,
            id_provenance: provenance.parse().unwrap_or(IdProvenance::Absent),
            posted_at: parse_ts(&posted_at),
            text: row.get("text")?,
            views: views.map(|v| v as u64),
            forwards: forwards.map(|v| v as u64),
            reply_count: reply_count.map(|v| v as u64),
            reactions: serde_json::from_str(&reactions).unwrap_or_default(),
            media: serde_json::from_str(&media).unwrap_or_default(),
            forwarded_from: row.get("forwarded_from")?,
            edited_at: parse_ts_opt(row.get("edited_at")?),
            is_pinned: row.get("is_pinned")?,
            backend: backend.parse().unwrap_or_default(),
            collected_at: parse_ts(&collected_at),
        })
    }

    /// Oldest and newest post timestamps for a channel
    pub fn message_time_span(
        &self,
        channel_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.conn();
        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(posted_at), MAX(posted_at) FROM messages WHERE channel_id = ?",
            [channel_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(parse_ts_opt(oldest).zip(parse_ts_opt(newest)))
    }

    /// Mean delay between posting and collection, in seconds
    pub fn average_collection_latency(&self, channel_id: i64) -> Result<Option<f64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT posted_at, collected_at FROM messages WHERE channel_id = ?")?;
        let pairs = stmt
            .query_map([channel_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let latencies: Vec<f64> = pairs
            .iter()
            .filter_map(|(posted, collected)| {
                let posted = DateTime::parse_from_rfc3339(posted).ok()?;
                let collected = DateTime::parse_from_rfc3339(collected).ok()?;
                Some((collected - posted).num_milliseconds() as f64 / 1000.0)
            })
            .collect();

        if latencies.is_empty() {
            return Ok(None);
        }
        Ok(Some(latencies.iter().sum::<f64>() / latencies.len() as f64))
    }

    // ============================================
    // Checkpoint operations
    // ============================================

    /// Get the stored checkpoint for a channel
    pub fn load_checkpoint(&self, channel_id: i64) -> Result<Option<Checkpoint>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT * FROM checkpoints WHERE channel_id = ?",
            [channel_id],
            Self::row_to_checkpoint,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Insert or replace a channel checkpoint
    pub fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO checkpoints (channel_id, channel_name, last_message_id,
                                     messages_collected, batches_flushed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(channel_id) DO UPDATE SET
                channel_name = excluded.channel_name,
                last_message_id = excluded.last_message_id,
                messages_collected = excluded.messages_collected,
                batches_flushed = excluded.batches_flushed,
                updated_at = excluded.updated_at
            "#,
            params![
                checkpoint.channel_id,
                checkpoint.channel_name,
                checkpoint.last_message_id,
                checkpoint.messages_collected as i64,
                checkpoint.batches_flushed as i64,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_checkpoint(row: &Row) -> rusqlite::Result<Checkpoint> {
        let updated_at: String = row.get("updated_at")?;
        let collected: i64 = row.get("messages_collected")?;
        let batches: i64 = row.get("batches_flushed")?;
        Ok(Checkpoint {
            channel_id: row.get("channel_id")?,
            channel_name: row.get("channel_name")?,
            last_message_id: row.get("last_message_id")?,
            messages_collected: collected as u64,
            batches_flushed: batches as u64,
            updated_at: parse_ts(&updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn message(channel: &ChannelRef, id: i64, text: &str) -> MessageRecord {
        let posted_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::minutes(id);
        MessageRecord {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            message_id: Some(id),
            id_provenance: IdProvenance::Authoritative,
            posted_at,
            text: text.to_string(),
            views: Some(10),
            forwards: Some(0),
            reply_count: Some(0),
            reactions: vec![Reaction {
                label: "👍".to_string(),
                count: 3,
            }],
            media: vec![],
            forwarded_from: None,
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Api,
            collected_at: posted_at + Duration::seconds(30),
        }
    }

    #[test]
    fn test_channel_roundtrip() {
        let db = test_db();
        let channel = ChannelRef::new(1001, "news");
        db.upsert_channel(&channel, BackendKind::Api, true).unwrap();
        db.update_channel_info(
            1001,
            &ChannelInfo {
                id: Some(1001),
                name: "news".to_string(),
                title: Some("News".to_string()),
                about: None,
                participants: Some(1200),
            },
        )
        .unwrap();

        let stored = db.get_channel(1001).unwrap().unwrap();
        assert_eq!(stored.channel, channel);
        assert_eq!(stored.backend, BackendKind::Api);
        assert!(stored.ids_authoritative);
        assert_eq!(stored.info.title.as_deref(), Some("News"));
        assert_eq!(stored.info.participants, Some(1200));

        let by_name = db.find_channel("@news").unwrap().unwrap();
        assert_eq!(by_name.channel.id, 1001);
        assert!(db.get_channel(7).unwrap().is_none());
    }

    #[test]
    fn test_insert_messages_is_idempotent() {
        let db = test_db();
        let channel = ChannelRef::new(1, "news");
        db.upsert_channel(&channel, BackendKind::Api, true).unwrap();

        let batch: Vec<_> = (1..=5).map(|id| message(&channel, id, "hello")).collect();
        assert_eq!(db.insert_messages(1, &batch).unwrap(), 5);
        assert_eq!(db.insert_messages(1, &batch[2..]).unwrap(), 0);
        assert_eq!(db.count_messages(1).unwrap(), 5);

        let mut updated = message(&channel, 3, "hello again");
        updated.views = Some(99);
        db.insert_messages(1, &[updated]).unwrap();

        let stored = db.get_messages(1, 10).unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[2].text, "hello again");
        assert_eq!(stored[2].views, Some(99));
        assert_eq!(stored[0].reactions[0].count, 3);
        assert_eq!(stored[0].channel_name, "news");
    }

    #[test]
    fn test_inferred_ids_dedupe_on_content() {
        let db = test_db();
        let channel = ChannelRef::from_name("mirror");
        db.upsert_channel(&channel, BackendKind::Web, false).unwrap();

        let mut a = message(&channel, 10, "first");
        a.id_provenance = IdProvenance::Inferred;
        let mut b = message(&channel, 10, "second");
        b.id_provenance = IdProvenance::Inferred;
        b.posted_at = a.posted_at;

        // Same inferred id, different content: both kept
        assert_eq!(db.insert_messages(channel.id, &[a.clone(), b]).unwrap(), 2);
        assert_eq!(db.insert_messages(channel.id, &[a]).unwrap(), 0);
    }

    #[test]
    fn test_time_span_and_latency() {
        let db = test_db();
        let channel = ChannelRef::new(1, "news");
        db.upsert_channel(&channel, BackendKind::Api, true).unwrap();
        assert!(db.message_time_span(1).unwrap().is_none());
        assert!(db.average_collection_latency(1).unwrap().is_none());

        let batch: Vec<_> = (1..=3).map(|id| message(&channel, id, "x")).collect();
        db.insert_messages(1, &batch).unwrap();

        let (oldest, newest) = db.message_time_span(1).unwrap().unwrap();
        assert_eq!(oldest, batch[0].posted_at);
        assert_eq!(newest, batch[2].posted_at);

        let latency = db.average_collection_latency(1).unwrap().unwrap();
        assert!((latency - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_checkpoint_upsert() {
        let db = test_db();
        let channel = ChannelRef::new(1, "news");
        db.upsert_channel(&channel, BackendKind::Api, true).unwrap();
        assert!(db.load_checkpoint(1).unwrap().is_none());

        let mut checkpoint = Checkpoint {
            channel_id: 1,
            channel_name: "news".to_string(),
            last_message_id: Some(100),
            messages_collected: 50,
            batches_flushed: 1,
            updated_at: Utc::now(),
        };
        db.store_checkpoint(&checkpoint).unwrap();

        checkpoint.last_message_id = Some(150);
        checkpoint.batches_flushed = 2;
        db.store_checkpoint(&checkpoint).unwrap();

        let stored = db.load_checkpoint(1).unwrap().unwrap();
        assert_eq!(stored.last_message_id, Some(150));
        assert_eq!(stored.batches_flushed, 2);
        assert_eq!(stored.messages_collected, 50);
    }
}
