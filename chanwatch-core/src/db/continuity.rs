//! Continuity state and status history persistence.
//!
//! `message_continuity` holds the current status per `(channel, message id)`;
//! `message_status_history` is append-only and is the source of truth for
//! edit detection.

use super::{parse_ts, parse_ts_opt, Database};
use crate::error::{Error, Result};
use crate::types::{ContinuityRecord, MessageStatus, StatusHistoryEntry};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Continuity rows per status for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub observed: u64,
    pub edited: u64,
    pub deleted: u64,
    pub inaccessible: u64,
    pub unknown: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.observed + self.edited + self.deleted + self.inaccessible + self.unknown
    }
}

impl Database {
    /// Current continuity state of one message id
    pub fn get_continuity(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<ContinuityRecord>> {
        let conn = self.conn();
        Self::select_continuity(&conn, channel_id, message_id)
    }

    fn select_continuity(
        conn: &Connection,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<ContinuityRecord>> {
        conn.query_row(
            "SELECT * FROM message_continuity WHERE channel_id = ?1 AND message_id = ?2",
            params![channel_id, message_id],
            Self::row_to_continuity,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_continuity(row: &Row) -> rusqlite::Result<ContinuityRecord> {
        let status: String = row.get("status")?;
        let last_checked: String = row.get("last_checked_at")?;
        Ok(ContinuityRecord {
            channel_id: row.get("channel_id")?,
            message_id: row.get("message_id")?,
            observed: row.get("observed")?,
            status: status.parse().unwrap_or(MessageStatus::Unknown),
            first_seen_at: parse_ts_opt(row.get("first_seen_at")?),
            last_checked_at: parse_ts(&last_checked),
        })
    }

    /// Record a sighting. An `edited` status stays `edited`; anything else
    /// becomes `observed`. Returns the resulting status.
    pub fn mark_observed(
        &self,
        channel_id: i64,
        message_id: i64,
        at: DateTime<Utc>,
    ) -> Result<MessageStatus> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO message_continuity (channel_id, message_id, observed, status,
                                            first_seen_at, last_checked_at)
            VALUES (?1, ?2, 1, 'observed', ?3, ?3)
            ON CONFLICT(channel_id, message_id) DO UPDATE SET
                observed = 1,
                status = CASE WHEN message_continuity.status = 'edited'
                              THEN 'edited' ELSE 'observed' END,
                first_seen_at = COALESCE(message_continuity.first_seen_at, excluded.first_seen_at),
                last_checked_at = excluded.last_checked_at
            "#,
            params![channel_id, message_id, at.to_rfc3339()],
        )?;
        Self::current_status(&conn, channel_id, message_id)
    }

    /// Flip a message to `edited`
    pub fn mark_edited(&self, channel_id: i64, message_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            UPDATE message_continuity
            SET status = 'edited', observed = 1, last_checked_at = ?3
            WHERE channel_id = ?1 AND message_id = ?2
            "#,
            params![channel_id, message_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record that an expected id was not returned.
    ///
    /// A message that was ever seen becomes `deleted`; one that never was
    /// takes `status` (normally `unknown` or `inaccessible`). Returns the
    /// resulting status.
    pub fn record_gap_status(
        &self,
        channel_id: i64,
        message_id: i64,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<MessageStatus> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO message_continuity (channel_id, message_id, observed, status,
                                            first_seen_at, last_checked_at)
            VALUES (?1, ?2, 0, ?3, NULL, ?4)
            ON CONFLICT(channel_id, message_id) DO UPDATE SET
                status = CASE WHEN message_continuity.observed = 1
                                   OR message_continuity.status = 'deleted'
                              THEN 'deleted' ELSE excluded.status END,
                last_checked_at = excluded.last_checked_at
            "#,
            params![channel_id, message_id, status.as_str(), at.to_rfc3339()],
        )?;
        Self::current_status(&conn, channel_id, message_id)
    }

    /// Record an id that was returned but could not be read.
    ///
    /// Only a missing or `unknown` row becomes `inaccessible`; an earlier
    /// sighting or deletion is kept. Returns the resulting status.
    pub fn mark_inaccessible(
        &self,
        channel_id: i64,
        message_id: i64,
        at: DateTime<Utc>,
    ) -> Result<MessageStatus> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO message_continuity (channel_id, message_id, observed, status,
                                            first_seen_at, last_checked_at)
            VALUES (?1, ?2, 0, 'inaccessible', NULL, ?3)
            ON CONFLICT(channel_id, message_id) DO UPDATE SET
                status = CASE WHEN message_continuity.status = 'unknown'
                              THEN 'inaccessible' ELSE message_continuity.status END,
                last_checked_at = excluded.last_checked_at
            "#,
            params![channel_id, message_id, at.to_rfc3339()],
        )?;
        Self::current_status(&conn, channel_id, message_id)
    }

    /// Record a confirmed deletion
    pub fn mark_deleted(&self, channel_id: i64, message_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO message_continuity (channel_id, message_id, observed, status,
                                            first_seen_at, last_checked_at)
            VALUES (?1, ?2, 0, 'deleted', NULL, ?3)
            ON CONFLICT(channel_id, message_id) DO UPDATE SET
                status = 'deleted',
                last_checked_at = excluded.last_checked_at
            "#,
            params![channel_id, message_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn current_status(
        conn: &Connection,
        channel_id: i64,
        message_id: i64,
    ) -> Result<MessageStatus> {
        Ok(Self::select_continuity(conn, channel_id, message_id)?
            .map(|r| r.status)
            .unwrap_or(MessageStatus::Unknown))
    }

    /// Append one status history entry. History is never updated.
    pub fn append_status_history(&self, entry: &StatusHistoryEntry) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO message_status_history (channel_id, message_id, status, observed_at,
                                                content_checksum, content_length, run_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.channel_id,
                entry.message_id,
                entry.status.as_str(),
                entry.observed_at.to_rfc3339(),
                entry.content_checksum,
                entry.content_length.map(|l| l as i64),
                entry.run_id,
            ],
        )?;
        Ok(())
    }

    /// Checksum of the most recent content-bearing history entry.
    ///
    /// Both `observed` and `edited` entries carry the text as it was seen,
    /// so re-observing edited text does not count as a second edit.
    pub fn latest_content_checksum(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            r#"
            SELECT content_checksum FROM message_status_history
            WHERE channel_id = ?1 AND message_id = ?2
              AND status IN ('observed', 'edited')
              AND content_checksum IS NOT NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
            params![channel_id, message_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Full history of one message id, oldest first
    pub fn get_status_history(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Vec<StatusHistoryEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM message_status_history
            WHERE channel_id = ?1 AND message_id = ?2
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![channel_id, message_id], |row| {
                let status: String = row.get("status")?;
                let observed_at: String = row.get("observed_at")?;
                let length: Option<i64> = row.get("content_length")?;
                Ok(StatusHistoryEntry {
                    channel_id: row.get("channel_id")?,
                    message_id: row.get("message_id")?,
                    status: status.parse().unwrap_or(MessageStatus::Unknown),
                    observed_at: parse_ts(&observed_at),
                    content_checksum: row.get("content_checksum")?,
                    content_length: length.map(|l| l as usize),
                    run_id: row.get("run_id")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Continuity rows per status for a channel
    pub fn continuity_status_counts(&self, channel_id: i64) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM message_continuity WHERE channel_id = ? GROUP BY status",
        )?;
        let rows = stmt
            .query_map([channel_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<MessageStatus>() {
                Ok(MessageStatus::Observed) => counts.observed += count,
                Ok(MessageStatus::Edited) => counts.edited += count,
                Ok(MessageStatus::Deleted) => counts.deleted += count,
                Ok(MessageStatus::Inaccessible) => counts.inaccessible += count,
                Ok(MessageStatus::Unknown) | Err(_) => counts.unknown += count,
            }
        }
        Ok(counts)
    }

    /// Lowest and highest tracked message id for a channel
    pub fn continuity_id_range(&self, channel_id: i64) -> Result<Option<(i64, i64)>> {
        let conn = self.conn();
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(message_id), MAX(message_id) FROM message_continuity WHERE channel_id = ?",
            [channel_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(min.zip(max))
    }

    /// Earliest and latest `observed` history timestamps for a channel
    pub fn observed_time_span(
        &self,
        channel_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let conn = self.conn();
        let (first, last): (Option<String>, Option<String>) = conn.query_row(
            r#"
            SELECT MIN(observed_at), MAX(observed_at) FROM message_status_history
            WHERE channel_id = ? AND status = 'observed'
            "#,
            [channel_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(parse_ts_opt(first).zip(parse_ts_opt(last)))
    }
}
