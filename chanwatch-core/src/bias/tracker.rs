//! Continuity tracking: which message ids were observed, edited, deleted or
//! never seen.
//!
//! Edit detection reads only the append-only status history, so it gives the
//! same answer across process restarts. Gap detection uses the ids observed
//! during the current run and is gated on the channel's backend declaring
//! authoritative ids.

use super::metrics::BiasMetrics;
use crate::capabilities::Capabilities;
use crate::db::Database;
use crate::error::Result;
use crate::types::{
    BackendKind, ChannelRef, IdProvenance, MessageRecord, MessageStatus, StatusHistoryEntry,
};
use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Widest id span expanded into individual gap rows in one pass
pub const MAX_GAP_SPAN: i64 = 100_000;

/// Outcome of recording one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this id was seen with content
    First,
    /// Seen before with the same content
    Unchanged,
    /// Content differs from the last observation
    Edited,
    /// Record carries no id to track
    Untracked,
}

struct ChannelState {
    backend: BackendKind,
    capabilities: Capabilities,
    /// Authoritative ids returned during this run, readable or not
    observed: BTreeSet<i64>,
    /// Highest id already covered by incremental gap detection
    scanned_through: Option<i64>,
}

/// Per-run continuity tracker backed by the database.
pub struct ContinuityTracker {
    db: Arc<Database>,
    run_id: Option<String>,
    channels: HashMap<i64, ChannelState>,
}

impl ContinuityTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            run_id: None,
            channels: HashMap::new(),
        }
    }

    /// Tag subsequent history entries with a run id
    pub fn set_run_id(&mut self, run_id: Option<String>) {
        self.run_id = run_id;
    }

    /// Register a channel and the backend that collects it.
    pub fn register_channel(&mut self, channel: &ChannelRef, backend: BackendKind) -> Result<()> {
        let state = persist_channel(&self.db, channel, backend)?;
        self.channels.insert(channel.id, state);
        Ok(())
    }

    fn state_for(&mut self, record: &MessageRecord) -> Result<&mut ChannelState> {
        let state = match self.channels.entry(record.channel_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let channel = ChannelRef::new(record.channel_id, record.channel_name.clone());
                entry.insert(persist_channel(&self.db, &channel, record.backend)?)
            }
        };
        Ok(state)
    }

    /// Whether gap and deletion inference runs for a channel
    pub fn infers_gaps(&self, channel_id: i64) -> bool {
        self.channels
            .get(&channel_id)
            .map(|s| s.capabilities.message_id_reliable)
            .unwrap_or(false)
    }

    /// Record one observed message and detect edits.
    pub fn record_message(&mut self, record: &MessageRecord) -> Result<Observation> {
        let Some(message_id) = record.message_id else {
            return Ok(Observation::Untracked);
        };
        let run_id = self.run_id.clone();
        let db = Arc::clone(&self.db);
        let state = self.state_for(record)?;

        let edit_detection = state.capabilities.edit_detection;
        match record.id_provenance {
            IdProvenance::Authoritative => {
                state.observed.insert(message_id);
            }
            IdProvenance::Inferred => {}
            IdProvenance::Absent => return Ok(Observation::Untracked),
        }

        let now = Utc::now();
        let checksum = record.content_checksum();
        let previous = db.latest_content_checksum(record.channel_id, message_id)?;

        db.mark_observed(record.channel_id, message_id, now)?;

        let observation = match previous {
            None => Observation::First,
            Some(prev) if prev == checksum => Observation::Unchanged,
            Some(_) if edit_detection => Observation::Edited,
            Some(_) => Observation::Unchanged,
        };

        let status = if observation == Observation::Edited {
            db.mark_edited(record.channel_id, message_id, now)?;
            tracing::debug!(
                channel_id = record.channel_id,
                message_id,
                "Edit detected"
            );
            MessageStatus::Edited
        } else {
            MessageStatus::Observed
        };

        db.append_status_history(&StatusHistoryEntry {
            channel_id: record.channel_id,
            message_id,
            status,
            observed_at: now,
            content_checksum: Some(checksum),
            content_length: Some(record.text.chars().count()),
            run_id,
        })?;

        Ok(observation)
    }

    /// Record an id the backend returned but that could not be normalized.
    ///
    /// The id counts as returned for gap detection, so it is never inferred
    /// deleted. A row with no earlier sighting becomes `inaccessible`.
    /// Returns `None` when the channel's ids are not authoritative.
    pub fn record_unreadable(
        &mut self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<MessageStatus>> {
        if !self.infers_gaps(channel_id) {
            return Ok(None);
        }
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.observed.insert(message_id);
        }

        let now = Utc::now();
        let before = self
            .db
            .get_continuity(channel_id, message_id)?
            .map(|r| r.status);
        let after = self.db.mark_inaccessible(channel_id, message_id, now)?;

        if after == MessageStatus::Inaccessible && before != Some(MessageStatus::Inaccessible) {
            self.db.append_status_history(&StatusHistoryEntry {
                channel_id,
                message_id,
                status: MessageStatus::Inaccessible,
                observed_at: now,
                content_checksum: None,
                content_length: None,
                run_id: self.run_id.clone(),
            })?;
        }
        Ok(Some(after))
    }

    /// Record an expected id that was not returned.
    ///
    /// Returns the resulting status, or `None` when the channel's ids are not
    /// authoritative and the report was ignored.
    pub fn record_gap(
        &mut self,
        channel_id: i64,
        message_id: i64,
        status: MessageStatus,
    ) -> Result<Option<MessageStatus>> {
        if !self.infers_gaps(channel_id) {
            return Ok(None);
        }

        let now = Utc::now();
        let before = self
            .db
            .get_continuity(channel_id, message_id)?
            .map(|r| r.status);
        let after = self
            .db
            .record_gap_status(channel_id, message_id, status, now)?;

        if after == MessageStatus::Deleted && before != Some(MessageStatus::Deleted) {
            self.db.append_status_history(&StatusHistoryEntry {
                channel_id,
                message_id,
                status: MessageStatus::Deleted,
                observed_at: now,
                content_checksum: None,
                content_length: None,
                run_id: self.run_id.clone(),
            })?;
        }

        Ok(Some(after))
    }

    /// Record a deletion confirmed by the backend.
    ///
    /// Ignored for backends that cannot detect deletions.
    pub fn record_deletion(&mut self, channel_id: i64, message_id: i64) -> Result<bool> {
        let detects = self
            .channels
            .get(&channel_id)
            .map(|s| s.capabilities.deletion_detection && s.capabilities.message_id_reliable)
            .unwrap_or(false);
        if !detects {
            return Ok(false);
        }

        let now = Utc::now();
        self.db.mark_deleted(channel_id, message_id, now)?;
        self.db.append_status_history(&StatusHistoryEntry {
            channel_id,
            message_id,
            status: MessageStatus::Deleted,
            observed_at: now,
            content_checksum: None,
            content_length: None,
            run_id: self.run_id.clone(),
        })?;
        Ok(true)
    }

    /// Record every id in `[min_id, max_id]` not observed this run as a gap.
    ///
    /// Spans wider than [`MAX_GAP_SPAN`] are logged and left unexpanded.
    pub fn detect_gaps(&mut self, channel_id: i64, min_id: i64, max_id: i64) -> Result<Vec<i64>> {
        if !self.infers_gaps(channel_id) || min_id > max_id {
            return Ok(vec![]);
        }
        let span = max_id.saturating_sub(min_id).saturating_add(1);
        if span > MAX_GAP_SPAN {
            tracing::warn!(
                channel_id,
                min_id,
                max_id,
                limit = MAX_GAP_SPAN,
                "Id span too wide for gap detection, skipping"
            );
            return Ok(vec![]);
        }

        let gaps = match self.channels.get(&channel_id) {
            Some(state) => missing_ids(&state.observed, min_id, max_id),
            None => return Ok(vec![]),
        };

        for &id in &gaps {
            self.record_gap(channel_id, id, MessageStatus::Unknown)?;
        }

        if !gaps.is_empty() {
            tracing::info!(
                channel_id,
                min_id,
                max_id,
                gaps = gaps.len(),
                "Gaps recorded"
            );
        }
        Ok(gaps)
    }

    /// Start incremental gap detection just above `resume_after`.
    ///
    /// Without a resume point the floor sits below the lowest id tracked by
    /// earlier runs, so ids missing at the start of this run are still
    /// checked.
    pub fn set_scan_floor(&mut self, channel_id: i64, resume_after: Option<i64>) -> Result<()> {
        if !self.infers_gaps(channel_id) {
            return Ok(());
        }
        let floor = match resume_after {
            Some(id) => Some(id),
            None => self
                .db
                .continuity_id_range(channel_id)?
                .map(|(min, _)| min - 1),
        };
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.scanned_through = floor;
        }
        Ok(())
    }

    /// Gap detection over ids observed since the previous call.
    ///
    /// Assumes ids arrive in ascending order within a run.
    pub fn detect_new_gaps(&mut self, channel_id: i64) -> Result<Vec<i64>> {
        let Some(state) = self.channels.get(&channel_id) else {
            return Ok(vec![]);
        };
        let (Some(&first), Some(&last)) = (state.observed.first(), state.observed.last()) else {
            return Ok(vec![]);
        };
        let from = state.scanned_through.map(|s| s + 1).unwrap_or(first);
        if from > last {
            return Ok(vec![]);
        }

        let gaps = self.detect_gaps(channel_id, from, last)?;
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.scanned_through = Some(last);
        }
        Ok(gaps)
    }

    /// Ids observed for a channel during this run
    pub fn observed_ids(&self, channel_id: i64) -> Vec<i64> {
        self.channels
            .get(&channel_id)
            .map(|s| s.observed.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Compute bias metrics for a channel from persisted state.
    pub fn compute_metrics(&self, channel_id: i64) -> Result<BiasMetrics> {
        let stored = self.db.get_channel(channel_id)?;
        let (name, backend) = match (&stored, self.channels.get(&channel_id)) {
            (Some(s), _) => (s.channel.name.clone(), s.backend),
            (None, Some(state)) => (String::new(), state.backend),
            (None, None) => (String::new(), BackendKind::default()),
        };
        compute_metrics(&self.db, channel_id, name, backend)
    }
}

fn persist_channel(db: &Database, channel: &ChannelRef, backend: BackendKind) -> Result<ChannelState> {
    let capabilities = Capabilities::for_backend(backend);
    db.upsert_channel(channel, backend, capabilities.message_id_reliable)?;
    Ok(ChannelState {
        backend,
        capabilities,
        observed: BTreeSet::new(),
        scanned_through: None,
    })
}

/// Ids in `[min_id, max_id]` absent from `observed`, walking only the
/// observed ids inside the range.
fn missing_ids(observed: &BTreeSet<i64>, min_id: i64, max_id: i64) -> Vec<i64> {
    let mut missing = Vec::new();
    let mut next = min_id;
    for &id in observed.range(min_id..=max_id) {
        missing.extend(next..id);
        next = id + 1;
    }
    if next <= max_id {
        missing.extend(next..=max_id);
    }
    missing
}

/// Compute bias metrics straight from the database.
pub fn compute_metrics(
    db: &Database,
    channel_id: i64,
    channel_name: String,
    backend: BackendKind,
) -> Result<BiasMetrics> {
    let capabilities = Capabilities::for_backend(backend);
    let counts = db.continuity_status_counts(channel_id)?;
    // An id range is only an expectation when ids are contiguous by contract.
    let expected = if capabilities.message_id_reliable {
        db.continuity_id_range(channel_id)?
            .map(|(min, max)| (max - min + 1).max(0) as u64)
            .unwrap_or(0)
    } else {
        0
    };
    let observed = counts.observed + counts.edited;

    let message_span = db.message_time_span(channel_id)?;
    let observed_span = db.observed_time_span(channel_id)?;

    Ok(BiasMetrics {
        channel_id,
        channel_name,
        backend,
        bias_confidence: capabilities.metrics_confidence(),
        ids_authoritative: capabilities.message_id_reliable,
        expected_message_count: expected,
        observed_count: observed,
        gap_count: expected.saturating_sub(observed),
        deleted_count: counts.deleted,
        edited_count: counts.edited,
        possibly_deleted_count: counts.unknown + counts.inaccessible,
        oldest_message: message_span.map(|(oldest, _)| oldest),
        newest_message: message_span.map(|(_, newest)| newest),
        collection_start: observed_span.map(|(start, _)| start),
        collection_end: observed_span.map(|(_, end)| end),
        avg_collection_latency_secs: db.average_collection_latency(channel_id)?,
    })
}
