//! Database layer for chanwatch
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Message, channel and checkpoint persistence
//! - Continuity state and append-only status history
//! - Run manifest storage

mod continuity;
pub mod repo;
mod runs;
pub mod schema;

pub use continuity::StatusCounts;
pub use repo::{Database, StoredChannel};

use crate::error::Result;
use crate::types::{BackendKind, ChannelInfo, ChannelRef, Checkpoint, MessageRecord};
use chrono::{DateTime, Utc};

/// Persistence boundary consumed by the fetch loop.
///
/// A batch is the unit of durability: `save_messages` must be idempotent for
/// records that share a store key, since resume re-emits up to one batch.
pub trait MessageStore: Send + Sync {
    /// Make sure the channel exists before messages reference it.
    fn init_channel(
        &self,
        channel: &ChannelRef,
        backend: BackendKind,
        ids_authoritative: bool,
    ) -> Result<()>;

    /// Persist a batch, returning how many records were new.
    fn save_messages(&self, channel_id: i64, batch: &[MessageRecord]) -> Result<usize>;

    fn get_checkpoint(&self, channel_id: i64) -> Result<Option<Checkpoint>>;

    fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Id of a channel previously registered under `name`.
    fn lookup_channel(&self, name: &str) -> Result<Option<i64>>;

    /// Attach backend-reported metadata to a registered channel.
    fn store_channel_info(&self, channel_id: i64, info: &ChannelInfo) -> Result<()>;
}

impl MessageStore for Database {
    fn init_channel(
        &self,
        channel: &ChannelRef,
        backend: BackendKind,
        ids_authoritative: bool,
    ) -> Result<()> {
        self.upsert_channel(channel, backend, ids_authoritative)
    }

    fn save_messages(&self, channel_id: i64, batch: &[MessageRecord]) -> Result<usize> {
        self.insert_messages(channel_id, batch)
    }

    fn get_checkpoint(&self, channel_id: i64) -> Result<Option<Checkpoint>> {
        self.load_checkpoint(channel_id)
    }

    fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store_checkpoint(checkpoint)
    }

    fn lookup_channel(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.find_channel(name)?.map(|stored| stored.channel.id))
    }

    fn store_channel_info(&self, channel_id: i64, info: &ChannelInfo) -> Result<()> {
        self.update_channel_info(channel_id, info)
    }
}

/// Parse an RFC3339 column, falling back to now for corrupt values.
pub(crate) fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
