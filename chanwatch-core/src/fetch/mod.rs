//! Checkpointed fetch loop
//!
//! This module drives one [`SourceAdapter`] over a list of channels and turns
//! its message stream into persisted batches, continuity observations and a
//! finished run manifest.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  SourceAdapter  │ ──► │    Collector     │ ──► │  MessageStore   │
//! │ (api/web/mirror)│     │                  │     │ (batches, ckpt) │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//!         ▲                   │     │     │
//!         │ rotate            │     │     └──────► MediaPool (workers)
//!   ┌─────────────┐           │     ▼
//!   │  ProxyPool  │ ◄─────────┘  RunContext
//!   └─────────────┘              ├─ ContinuityTracker
//!                                └─ RunRecorder
//! ```
//!
//! Per channel the loop walks
//! `Init → Resuming → Fetching → (FloodWait → Fetching)* → Draining → Done`.
//! A batch is flushed when it reaches `collection.batch_size`; the checkpoint
//! then moves to the *oldest* id of that batch, so a crash between the two
//! writes re-fetches at most one batch instead of skipping one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chanwatch_core::{Config, Database};
//! use chanwatch_core::bias::RunContext;
//! use chanwatch_core::fetch::Collector;
//! use chanwatch_core::source::SourceAdapter;
//!
//! let db = Arc::new(Database::open(&Config::database_path())?);
//! let mut adapter = SourceAdapter::from_config(&config.source)?;
//! let mut ctx = RunContext::new(db.clone(), Config::manifest_dir());
//!
//! let summary = Collector::new(db, &config)
//!     .run(&mut adapter, &mut ctx, &["durov".to_string()], None)
//!     .await?;
//! println!("Collected {} messages", summary.total_collected());
//! ```

mod backoff;
mod media;

pub use backoff::{FloodBackoff, FloodDecision};
pub use media::{HttpMediaFetcher, MediaFetcher, MediaPool, MediaStats, MediaTask};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::bias::{RunContext, RunManifest, RunRequest};
use crate::capabilities::Capabilities;
use crate::config::{CollectionConfig, Config, RateLimitConfig};
use crate::db::MessageStore;
use crate::error::{Error, ErrorClass, Result};
use crate::filter::MessageFilter;
use crate::rotation::ProxyPool;
use crate::source::{MessageStream, ScrapeOptions, SourceAdapter};
use crate::types::{
    discovered_forwards, normalize_channel_name, ChannelInfo, ChannelRef, Checkpoint,
    MessageRecord, ScrapeMode,
};

/// First delay between retries of a failed page
const PAGE_RETRY_BASE: Duration = Duration::from_millis(500);
/// Ceiling for the page retry delay
const PAGE_RETRY_CAP: Duration = Duration::from_secs(30);

/// Where a channel's fetch loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchState {
    #[default]
    Init,
    Resuming,
    Fetching,
    FloodWait,
    /// Recovering from a failed item or page
    Error,
    Draining,
    Done,
}

impl FetchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchState::Init => "init",
            FetchState::Resuming => "resuming",
            FetchState::Fetching => "fetching",
            FetchState::FloodWait => "flood_wait",
            FetchState::Error => "error",
            FetchState::Draining => "draining",
            FetchState::Done => "done",
        }
    }
}

impl std::fmt::Display for FetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative stop request, observed between messages.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of collecting one channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelOutcome {
    /// Resolved channel handle
    pub channel: Option<ChannelRef>,
    /// Metadata reported by the backend, if any
    pub info: Option<ChannelInfo>,
    pub final_state: FetchState,
    /// Records pulled from the stream
    pub collected: usize,
    /// Records that were new to the store
    pub inserted: usize,
    /// Items that failed to normalize or were filtered out
    pub skipped: usize,
    /// Records rejected by the message filter
    pub filtered: usize,
    /// Item and page errors survived
    pub errors: usize,
    pub batches_flushed: usize,
    pub flood_waits: usize,
    pub rotations: usize,
    /// Checkpoint the stream resumed after
    pub resumed_from: Option<i64>,
    /// Checkpoint after the last flush
    pub checkpoint: Option<i64>,
    /// Ids recorded as gaps during this collection
    pub new_gaps: usize,
    /// Stopped by a [`StopSignal`] before the source was exhausted
    pub stopped: bool,
    /// Forward sources seen in flushed batches, first-seen order
    pub forwards: Vec<String>,
}

/// Result of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Finalized manifest
    pub manifest: Option<RunManifest>,
    /// Channels collected to completion or until stopped
    pub channels: Vec<ChannelOutcome>,
    /// Channels that could not be read (name → message)
    pub failures: Vec<(String, String)>,
    /// Media pool totals, when downloads were enabled
    pub media: Option<MediaStats>,
}

impl RunSummary {
    pub fn total_collected(&self) -> usize {
        self.channels.iter().map(|c| c.collected).sum()
    }

    pub fn total_inserted(&self) -> usize {
        self.channels.iter().map(|c| c.inserted).sum()
    }

    pub fn stopped(&self) -> bool {
        self.channels.iter().any(|c| c.stopped)
    }
}

type ProgressFn = Box<dyn Fn(&ChannelOutcome) + Send + Sync>;

/// Per-channel mutable state threaded through the loop.
struct ChannelRun {
    channel: ChannelRef,
    caps: Capabilities,
    batch: Vec<MessageRecord>,
    checkpoint: Checkpoint,
    backoff: FloodBackoff,
    state: FetchState,
    outcome: ChannelOutcome,
}

impl ChannelRun {
    fn enter(&mut self, next: FetchState) {
        if self.state != next {
            tracing::trace!(
                channel = %self.channel.name,
                from = %self.state,
                to = %next,
                "Fetch state"
            );
            self.state = next;
        }
    }
}

/// Drives source adapters through the checkpointed fetch loop.
///
/// The collector is responsible for:
/// - Connecting through the proxy pool, with one retry on a failed handshake
/// - Resuming from stored checkpoints when the backend supports it
/// - Batching records into the store and advancing checkpoints
/// - Feeding every record to the continuity tracker and run recorder
/// - Dropping records the message filter rejects before they are stored
/// - Flood-wait backoff and endpoint rotation
/// - Queueing media downloads
pub struct Collector {
    store: Arc<dyn MessageStore>,
    collection: CollectionConfig,
    rate_limit: RateLimitConfig,
    scrape: ScrapeOptions,
    pool: Option<Arc<ProxyPool>>,
    media: Option<MediaPool>,
    filter: Option<MessageFilter>,
    stop: StopSignal,
    progress: Option<ProgressFn>,
}

impl Collector {
    pub fn new(store: Arc<dyn MessageStore>, config: &Config) -> Self {
        Self {
            store,
            collection: config.collection.clone(),
            rate_limit: config.rate_limit.clone(),
            scrape: ScrapeOptions::from_config(&config.source),
            pool: None,
            media: None,
            filter: None,
            stop: StopSignal::new(),
            progress: None,
        }
    }

    /// Connect and rotate through `pool`.
    pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Queue media attachments on `pool` when `collection.download_media` is set.
    pub fn with_media(mut self, pool: MediaPool) -> Self {
        self.media = Some(pool);
        self
    }

    /// Store only records `filter` matches.
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Called after every flushed batch.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&ChannelOutcome) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Collect `channels` as one run.
    ///
    /// Channels that turn out private or invalid are reported in
    /// [`RunSummary::failures`] and the run moves on. Any other session-fatal
    /// error ends the run and is returned once media downloads have drained
    /// and the manifest has been finalized.
    pub async fn run(
        mut self,
        adapter: &mut SourceAdapter,
        ctx: &mut RunContext,
        channels: &[String],
        limit: Option<usize>,
    ) -> Result<RunSummary> {
        ctx.start_run(self.run_request(adapter, channels, limit))?;

        let mut summary = RunSummary::default();
        let mut fatal = None;

        for name in channels {
            if self.stop.is_stopped() {
                tracing::info!(channel = %name, "Stop requested, skipping remaining channels");
                break;
            }
            match self.collect_channel(adapter, ctx, name, limit).await {
                Ok(outcome) => summary.channels.push(outcome),
                Err(e) if e.is_channel_access() => {
                    tracing::warn!(channel = %name, error = %e, "Channel not readable");
                    ctx.recorder.record_error();
                    summary.failures.push((name.clone(), e.to_string()));
                }
                Err(e) => {
                    tracing::error!(channel = %name, error = %e, "Run aborted");
                    ctx.recorder.record_error();
                    fatal = Some(e);
                    break;
                }
            }
        }

        if let Some(pool) = self.media.take() {
            summary.media = Some(pool.finish().await);
        }
        adapter.disconnect().await;
        summary.manifest = ctx.end_run()?;

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn run_request(
        &self,
        adapter: &SourceAdapter,
        channels: &[String],
        limit: Option<usize>,
    ) -> RunRequest {
        let mut parameters = serde_json::Map::new();
        parameters.insert("batch_size".into(), self.collection.batch_size.into());
        parameters.insert("page_size".into(), self.scrape.page_size.into());
        parameters.insert("resume".into(), self.collection.resume.into());
        parameters.insert(
            "download_media".into(),
            (self.collection.download_media && self.media.is_some()).into(),
        );
        parameters.insert(
            "rotate_after".into(),
            self.rate_limit.rotate_after.into(),
        );
        if let Some(filter) = &self.filter {
            parameters.insert("filter".into(), filter.criteria().into());
        }
        if let Some(pool) = &self.pool {
            parameters.insert("proxy_strategy".into(), pool.strategy().as_str().into());
            parameters.insert("proxy_endpoints".into(), pool.len().into());
        }

        RunRequest {
            backend: adapter.kind(),
            channels: channels
                .iter()
                .map(|c| normalize_channel_name(c))
                .collect(),
            mode: self.collection.mode,
            sampling_interval_minutes: self.collection.sampling_interval_minutes,
            message_limit: limit,
            parameters,
        }
    }

    /// Open the adapter's session.
    ///
    /// Without a pool the connection is direct. A pool with no live endpoint
    /// degrades to a direct connection with a warning. A failed handshake is
    /// retried once through a different endpoint.
    pub async fn connect(&self, adapter: &mut SourceAdapter) -> Result<()> {
        let Some(pool) = &self.pool else {
            return adapter.connect(None).await;
        };
        let Some(first) = pool.select() else {
            tracing::warn!(
                endpoints = pool.len(),
                "No live proxy endpoints, connecting directly"
            );
            return adapter.connect(None).await;
        };

        let err = match adapter.connect(Some(&first)).await {
            Ok(()) => {
                pool.report_success(&first.key());
                return Ok(());
            }
            Err(e) if e.class() == ErrorClass::SessionFatal => return Err(e),
            Err(e) => e,
        };

        pool.report_failure(&first.key());
        let Some(second) = pool.select_excluding(&first.key()) else {
            return Err(err);
        };
        tracing::warn!(
            endpoint = %first,
            retry = %second,
            error = %err,
            "Handshake failed, retrying through another endpoint"
        );

        match adapter.connect(Some(&second)).await {
            Ok(()) => {
                pool.report_success(&second.key());
                Ok(())
            }
            Err(e) => {
                pool.report_failure(&second.key());
                Err(e)
            }
        }
    }

    /// Collect one channel until the source is exhausted, `limit` is
    /// reached or a stop is requested.
    pub async fn collect_channel(
        &self,
        adapter: &mut SourceAdapter,
        ctx: &mut RunContext,
        name: &str,
        limit: Option<usize>,
    ) -> Result<ChannelOutcome> {
        if !adapter.is_connected() {
            self.connect(adapter).await?;
        }

        let caps = adapter.capabilities();
        let (channel, info) = self.resolve(adapter, name).await?;

        self.store
            .init_channel(&channel, adapter.kind(), caps.message_id_reliable)?;
        if let Some(info) = &info {
            self.store.store_channel_info(channel.id, info)?;
        }
        ctx.tracker.register_channel(&channel, adapter.kind())?;

        let checkpoint = self
            .store
            .get_checkpoint(channel.id)?
            .unwrap_or_else(|| Checkpoint {
                channel_id: channel.id,
                channel_name: channel.name.clone(),
                last_message_id: None,
                messages_collected: 0,
                batches_flushed: 0,
                updated_at: Utc::now(),
            });

        let mut run = ChannelRun {
            channel: channel.clone(),
            caps,
            batch: Vec::with_capacity(self.collection.batch_size),
            outcome: ChannelOutcome {
                channel: Some(channel.clone()),
                info,
                checkpoint: checkpoint.last_message_id,
                ..Default::default()
            },
            checkpoint,
            backoff: FloodBackoff::new(&self.rate_limit),
            state: FetchState::Init,
        };

        let resume_after = self.resume_point(&run);
        if let Some(id) = resume_after {
            run.enter(FetchState::Resuming);
            tracing::info!(channel = %channel.name, checkpoint = id, "Resuming");
        }
        run.outcome.resumed_from = resume_after;
        ctx.tracker.set_scan_floor(channel.id, resume_after)?;

        let options = ScrapeOptions {
            limit,
            resume_after,
            ..self.scrape.clone()
        };

        let fetched = {
            let mut stream = adapter.scrape(channel.clone(), options);
            run.enter(FetchState::Fetching);
            self.fetch_loop(&mut stream, ctx, &mut run).await
        };

        run.enter(FetchState::Draining);
        let drained = self.flush(ctx, &mut run);

        fetched?;
        drained?;

        run.enter(FetchState::Done);
        run.outcome.final_state = FetchState::Done;
        tracing::info!(
            channel = %channel.name,
            collected = run.outcome.collected,
            inserted = run.outcome.inserted,
            skipped = run.outcome.skipped,
            filtered = run.outcome.filtered,
            flood_waits = run.outcome.flood_waits,
            rotations = run.outcome.rotations,
            gaps = run.outcome.new_gaps,
            stopped = run.outcome.stopped,
            "Channel collected"
        );
        Ok(run.outcome)
    }

    /// Stored id first so ids stay stable when metadata is unavailable on
    /// a later run.
    async fn resolve(
        &self,
        adapter: &SourceAdapter,
        name: &str,
    ) -> Result<(ChannelRef, Option<ChannelInfo>)> {
        let normalized = normalize_channel_name(name);
        if normalized.is_empty() {
            return Err(Error::ChannelInvalid(name.to_string()));
        }

        let (resolved, info) = adapter.resolve_channel(&normalized).await?;
        let channel = match self.store.lookup_channel(&normalized)? {
            Some(id) if id != resolved.id => {
                tracing::debug!(
                    channel = %normalized,
                    stored = id,
                    reported = resolved.id,
                    "Keeping stored channel id"
                );
                ChannelRef::new(id, normalized)
            }
            _ => resolved,
        };
        Ok((channel, info))
    }

    fn resume_point(&self, run: &ChannelRun) -> Option<i64> {
        if !self.collection.resume || self.collection.mode == ScrapeMode::Full {
            return None;
        }
        if !run.caps.resume_by_id {
            if run.checkpoint.last_message_id.is_some() {
                tracing::debug!(
                    channel = %run.channel.name,
                    "Backend cannot resume by id, ignoring checkpoint"
                );
            }
            return None;
        }
        run.checkpoint.last_message_id
    }

    async fn fetch_loop(
        &self,
        stream: &mut MessageStream<'_>,
        ctx: &mut RunContext,
        run: &mut ChannelRun,
    ) -> Result<()> {
        let media_enabled =
            self.collection.download_media && run.caps.media_reachable() && self.media.is_some();
        let mut page_failures: u32 = 0;
        let mut retry_delay = PAGE_RETRY_BASE;

        loop {
            if self.stop.is_stopped() {
                tracing::info!(channel = %run.channel.name, "Stop requested");
                run.outcome.stopped = true;
                return Ok(());
            }

            let Some(next) = stream.next_message().await else {
                return Ok(());
            };

            let record = match next {
                Ok(record) => record,
                Err(e) => match e.class() {
                    ErrorClass::Item => {
                        run.enter(FetchState::Error);
                        tracing::warn!(channel = %run.channel.name, error = %e, "Skipping item");
                        if let Some(id) = e.item_id() {
                            ctx.tracker.record_unreadable(run.channel.id, id)?;
                        }
                        run.outcome.skipped += 1;
                        run.outcome.errors += 1;
                        ctx.recorder.record_skipped();
                        ctx.recorder.record_error();
                        run.enter(FetchState::Fetching);
                        continue;
                    }
                    ErrorClass::Transient => {
                        run.enter(FetchState::Error);
                        page_failures += 1;
                        run.outcome.errors += 1;
                        ctx.recorder.record_error();
                        if page_failures > self.collection.max_page_retries {
                            tracing::error!(
                                channel = %run.channel.name,
                                attempts = page_failures,
                                error = %e,
                                "Giving up on page"
                            );
                            return Err(e);
                        }
                        tracing::warn!(
                            channel = %run.channel.name,
                            attempt = page_failures,
                            delay_ms = retry_delay.as_millis() as u64,
                            error = %e,
                            "Page failed, retrying"
                        );
                        tokio::time::sleep(retry_delay).await;
                        retry_delay = (retry_delay * 2).min(PAGE_RETRY_CAP);
                        run.enter(FetchState::Fetching);
                        continue;
                    }
                    ErrorClass::RateLimit => {
                        let wait = match e {
                            Error::RateLimited { wait } => wait,
                            _ => Duration::ZERO,
                        };
                        self.flood_wait(stream, ctx, run, wait).await;
                        continue;
                    }
                    ErrorClass::SessionFatal => {
                        tracing::error!(channel = %run.channel.name, error = %e, "Session failed");
                        return Err(e);
                    }
                },
            };

            page_failures = 0;
            retry_delay = PAGE_RETRY_BASE;
            run.backoff.reset();

            ctx.tracker.record_message(&record)?;

            if let Some(filter) = &self.filter {
                if !filter.matches(&record).matched {
                    tracing::trace!(
                        channel = %run.channel.name,
                        message_id = ?record.message_id,
                        "Filtered out"
                    );
                    run.outcome.skipped += 1;
                    run.outcome.filtered += 1;
                    ctx.recorder.record_skipped();
                    continue;
                }
            }

            if media_enabled {
                if let Some(pool) = &self.media {
                    pool.enqueue_record(&record);
                }
            }
            run.batch.push(record);
            run.outcome.collected += 1;
            ctx.recorder.record_collected(1);

            if run.batch.len() >= self.collection.batch_size {
                self.flush(ctx, run)?;
            }
        }
    }

    /// Wait out a rate-limit signal, rotating endpoints when it keeps
    /// happening.
    async fn flood_wait(
        &self,
        stream: &mut MessageStream<'_>,
        ctx: &mut RunContext,
        run: &mut ChannelRun,
        mandated: Duration,
    ) {
        run.enter(FetchState::FloodWait);
        let decision = run.backoff.register(mandated);
        run.outcome.flood_waits += 1;
        ctx.recorder.record_flood_wait();

        let mut wait = decision.total();
        if decision.rotate && self.rotate(stream).await {
            run.outcome.rotations += 1;
            ctx.recorder.record_proxy_rotation();
            wait = run.backoff.after_rotation(&decision);
        }

        tracing::warn!(
            channel = %run.channel.name,
            mandated_secs = decision.mandated.as_secs(),
            penalty_secs = decision.penalty.as_secs(),
            wait_secs = wait.as_secs(),
            consecutive = decision.consecutive,
            "Flood wait"
        );
        tokio::time::sleep(wait).await;
        run.enter(FetchState::Fetching);
    }

    /// Move the stream to another endpoint. Returns whether it did.
    async fn rotate(&self, stream: &mut MessageStream<'_>) -> bool {
        let Some(pool) = &self.pool else {
            return false;
        };
        let previous = stream.adapter().endpoint().cloned();
        let next = match &previous {
            Some(current) => {
                pool.report_failure(&current.key());
                pool.select_excluding(&current.key())
            }
            None => pool.select(),
        };
        let Some(next) = next else {
            tracing::warn!("No alternative endpoint to rotate to");
            return false;
        };

        match stream.reconnect(Some(&next)).await {
            Ok(()) => {
                pool.report_success(&next.key());
                tracing::info!(
                    channel = %stream.channel().name,
                    endpoint = %next,
                    "Rotated endpoint"
                );
                true
            }
            Err(e) => {
                pool.report_failure(&next.key());
                tracing::warn!(endpoint = %next, error = %e, "Rotation failed, restoring previous path");
                if let Err(e) = stream.reconnect(previous.as_ref()).await {
                    tracing::error!(error = %e, "Could not restore previous connection");
                }
                false
            }
        }
    }

    /// Persist the pending batch, then advance the checkpoint.
    fn flush(&self, ctx: &mut RunContext, run: &mut ChannelRun) -> Result<()> {
        if run.batch.is_empty() {
            // Filtered and unreadable ids still close gaps
            run.outcome.new_gaps += ctx.tracker.detect_new_gaps(run.channel.id)?.len();
            return Ok(());
        }

        let inserted = self.store.save_messages(run.channel.id, &run.batch)?;

        if run.caps.resume_by_id {
            let oldest = run
                .batch
                .iter()
                .filter_map(MessageRecord::authoritative_id)
                .min();
            if let Some(oldest) = oldest {
                let advanced = run
                    .checkpoint
                    .last_message_id
                    .map_or(oldest, |prev| prev.max(oldest));
                run.checkpoint.last_message_id = Some(advanced);
            }
        }
        run.checkpoint.channel_name = run.channel.name.clone();
        run.checkpoint.messages_collected += run.batch.len() as u64;
        run.checkpoint.batches_flushed += 1;
        run.checkpoint.updated_at = Utc::now();
        self.store.update_checkpoint(&run.checkpoint)?;

        let gaps = ctx.tracker.detect_new_gaps(run.channel.id)?;

        for source in discovered_forwards(&run.batch) {
            if !run.outcome.forwards.contains(&source) {
                run.outcome.forwards.push(source);
            }
        }
        run.outcome.inserted += inserted;
        run.outcome.batches_flushed += 1;
        run.outcome.new_gaps += gaps.len();
        run.outcome.checkpoint = run.checkpoint.last_message_id;

        tracing::debug!(
            channel = %run.channel.name,
            batch = run.batch.len(),
            inserted,
            checkpoint = ?run.checkpoint.last_message_id,
            gaps = gaps.len(),
            "Batch flushed"
        );
        run.batch.clear();

        if let Some(progress) = &self.progress {
            progress(&run.outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::rotation::{HealthPolicy, ProxyEndpoint, ProxyKind, RotationStrategy};
    use crate::source::{PageRequest, RawPage, Transport};
    use crate::types::{BackendKind, MessageStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport whose handshake fails for listed hosts.
    #[derive(Default)]
    struct FlakyTransport {
        connected: bool,
        endpoint: Option<ProxyEndpoint>,
        refuse_hosts: Vec<String>,
        pages: Mutex<VecDeque<Result<RawPage>>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(&mut self, endpoint: Option<&ProxyEndpoint>) -> Result<()> {
            if let Some(e) = endpoint {
                if self.refuse_hosts.contains(&e.host) {
                    return Err(Error::Transport(format!("{} refused", e.host)));
                }
            }
            self.connected = true;
            self.endpoint = endpoint.cloned();
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
            self.endpoint = None;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn endpoint(&self) -> Option<&ProxyEndpoint> {
            self.endpoint.as_ref()
        }

        async fn channel_info(&self, _channel: &str) -> Result<Value> {
            Ok(json!({"id": 77, "title": "News"}))
        }

        async fn fetch_page(&self, _channel: &str, _request: &PageRequest) -> Result<RawPage> {
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RawPage::default()))
        }
    }

    fn items(ids: &[i64]) -> Vec<Value> {
        ids.iter()
            .map(|id| json!({"id": id, "date": 1709290000 + id, "message": format!("m{}", id)}))
            .collect()
    }

    fn page(ids: &[i64], next: Option<&str>) -> Result<RawPage> {
        Ok(RawPage {
            items: items(ids),
            next_offset: next.map(String::from),
        })
    }

    fn pool(hosts: &[&str]) -> Arc<ProxyPool> {
        let pool = ProxyPool::new(RotationStrategy::RoundRobin, HealthPolicy::default());
        for host in hosts {
            pool.add(ProxyEndpoint::new(ProxyKind::Socks5, *host, 1080));
        }
        Arc::new(pool)
    }

    fn setup(batch_size: usize) -> (Arc<Database>, Config, RunContext) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let mut config = Config::default();
        config.collection.batch_size = batch_size;
        let ctx = RunContext::in_database(db.clone());
        (db, config, ctx)
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        assert!(!clone.is_stopped());
        stop.stop();
        assert!(clone.is_stopped());
    }

    #[tokio::test]
    async fn test_connect_retries_once_through_another_endpoint() {
        let (db, config, _) = setup(10);
        let pool = pool(&["10.0.0.1", "10.0.0.2"]);
        let collector = Collector::new(db, &config).with_proxy_pool(pool.clone());

        let transport = FlakyTransport {
            refuse_hosts: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        collector.connect(&mut adapter).await.unwrap();

        assert_eq!(adapter.endpoint().unwrap().host, "10.0.0.2");
        assert_eq!(pool.get("10.0.0.1:1080").unwrap().failures, 1);
        assert_eq!(pool.get("10.0.0.2:1080").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn test_connect_surfaces_error_after_one_retry() {
        let (db, config, _) = setup(10);
        let pool = pool(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let collector = Collector::new(db, &config).with_proxy_pool(pool.clone());

        let transport = FlakyTransport {
            refuse_hosts: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        assert!(matches!(
            collector.connect(&mut adapter).await,
            Err(Error::Transport(_))
        ));
        assert!(!adapter.is_connected());
        assert_eq!(pool.get("10.0.0.3:1080").unwrap().successes, 0);
    }

    #[tokio::test]
    async fn test_empty_pool_degrades_to_direct() {
        let (db, config, _) = setup(10);
        let collector = Collector::new(db, &config).with_proxy_pool(pool(&[]));
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::<FlakyTransport>::default());
        collector.connect(&mut adapter).await.unwrap();
        assert!(adapter.is_connected());
        assert!(adapter.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_batches_advance_checkpoint_to_oldest_id() {
        let (db, config, mut ctx) = setup(2);
        let transport = FlakyTransport {
            pages: Mutex::new(
                vec![page(&[1, 2, 3], Some("p2")), page(&[4, 5], None)].into(),
            ),
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        let flushed = Arc::new(Mutex::new(Vec::new()));
        let seen = flushed.clone();
        let collector = Collector::new(db.clone(), &config)
            .with_progress(move |o| seen.lock().unwrap().push(o.checkpoint));

        let outcome = collector
            .collect_channel(&mut adapter, &mut ctx, "@news", None)
            .await
            .unwrap();

        assert_eq!(outcome.channel, Some(ChannelRef::new(77, "news")));
        assert_eq!(outcome.collected, 5);
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.batches_flushed, 3);
        assert_eq!(outcome.final_state, FetchState::Done);
        // Batches [1,2] [3,4] [5]
        assert_eq!(*flushed.lock().unwrap(), vec![Some(1), Some(3), Some(5)]);

        let checkpoint = db.load_checkpoint(77).unwrap().unwrap();
        assert_eq!(checkpoint.last_message_id, Some(5));
        assert_eq!(checkpoint.batches_flushed, 3);
        assert_eq!(db.count_messages(77).unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_page_errors_retry_then_give_up() {
        let (db, mut config, mut ctx) = setup(10);
        config.collection.max_page_retries = 2;
        let transport = FlakyTransport {
            pages: Mutex::new(
                vec![
                    page(&[1], Some("p2")),
                    Err(Error::Transport("reset".into())),
                    Err(Error::Transport("reset".into())),
                    Err(Error::Transport("reset".into())),
                ]
                .into(),
            ),
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        let collector = Collector::new(db.clone(), &config);

        let err = collector
            .collect_channel(&mut adapter, &mut ctx, "news", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        // The record before the failure was flushed while draining
        assert_eq!(db.count_messages(77).unwrap(), 1);
        assert_eq!(
            db.load_checkpoint(77).unwrap().unwrap().last_message_id,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_bad_items_are_skipped() {
        let (db, config, mut ctx) = setup(10);
        let mut raw = items(&[1, 3]);
        raw.insert(1, json!({"id": 2}));
        let transport = FlakyTransport {
            pages: Mutex::new(
                vec![Ok(RawPage {
                    items: raw,
                    next_offset: None,
                })]
                .into(),
            ),
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        let collector = Collector::new(db.clone(), &config);

        ctx.start_run(RunRequest {
            backend: BackendKind::Api,
            channels: vec!["news".into()],
            mode: ScrapeMode::Incremental,
            sampling_interval_minutes: None,
            message_limit: None,
            parameters: Default::default(),
        })
        .unwrap();
        let outcome = collector
            .collect_channel(&mut adapter, &mut ctx, "news", None)
            .await
            .unwrap();
        assert_eq!(outcome.collected, 2);
        assert_eq!(outcome.skipped, 1);
        // Id 2 was returned without a date: unreadable, not missing
        assert_eq!(outcome.new_gaps, 0);
        assert_eq!(
            db.get_continuity(77, 2).unwrap().unwrap().status,
            MessageStatus::Inaccessible
        );

        let manifest = ctx.end_run().unwrap().unwrap();
        assert_eq!(manifest.counters.messages_collected, 2);
        assert_eq!(manifest.counters.messages_skipped, 1);
        assert_eq!(manifest.counters.errors_encountered, 1);
    }

    #[tokio::test]
    async fn test_filtered_records_are_tracked_but_not_stored() {
        let (db, config, mut ctx) = setup(2);
        let transport = FlakyTransport {
            pages: Mutex::new(vec![page(&[1, 2, 5], None)].into()),
            ..Default::default()
        };
        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::new(transport));
        let filter = MessageFilter::from_config(&crate::config::FilterConfig {
            exclude: vec!["m5".into()],
            ..Default::default()
        })
        .unwrap()
        .unwrap();
        let collector = Collector::new(db.clone(), &config).with_filter(filter);

        ctx.start_run(collector.run_request(&adapter, &["news".to_string()], None))
            .unwrap();
        let outcome = collector
            .collect_channel(&mut adapter, &mut ctx, "news", None)
            .await
            .unwrap();

        assert_eq!(outcome.collected, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.filtered, 1);
        assert_eq!(outcome.errors, 0);
        // [1,2] flushed; the drain after 5 was filtered still finds 3 and 4
        assert_eq!(outcome.new_gaps, 2);
        assert_eq!(db.count_messages(77).unwrap(), 2);
        assert_eq!(
            db.get_continuity(77, 5).unwrap().unwrap().status,
            MessageStatus::Observed
        );

        let manifest = ctx.end_run().unwrap().unwrap();
        assert_eq!(manifest.counters.messages_skipped, 1);
        assert_eq!(manifest.parameters["filter"], json!(["exclude"]));
    }

    #[tokio::test]
    async fn test_full_mode_ignores_checkpoint() {
        let (db, mut config, mut ctx) = setup(10);
        config.collection.mode = ScrapeMode::Full;
        db.upsert_channel(&ChannelRef::new(77, "news"), BackendKind::Api, true)
            .unwrap();
        db.store_checkpoint(&Checkpoint {
            channel_id: 77,
            channel_name: "news".into(),
            last_message_id: Some(40),
            messages_collected: 40,
            batches_flushed: 4,
            updated_at: Utc::now(),
        })
        .unwrap();

        let mut adapter = SourceAdapter::new(BackendKind::Api, Box::<FlakyTransport>::default());
        let outcome = Collector::new(db, &config)
            .collect_channel(&mut adapter, &mut ctx, "news", None)
            .await
            .unwrap();
        assert_eq!(outcome.resumed_from, None);
        assert_eq!(outcome.checkpoint, Some(40));
    }
}
