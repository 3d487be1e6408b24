//! Run manifests for reproducibility.
//!
//! A manifest freezes the parameters of one collection run and accumulates
//! counters while it runs. At the end it is written to the `scrape_runs`
//! table and to a standalone `manifest_<id8>.json` artifact.

use crate::db::Database;
use crate::error::Result;
use crate::types::{BackendKind, ScrapeMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Counters accumulated while a run is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub messages_collected: u64,
    pub messages_skipped: u64,
    pub errors_encountered: u64,
    pub rate_limit_events: u64,
    pub rotation_events: u64,
}

/// Reproducibility record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub tool_version: String,
    pub platform: String,
    pub backend: BackendKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub channels: Vec<String>,
    pub mode: ScrapeMode,
    pub sampling_interval_minutes: Option<u32>,
    pub message_limit: Option<usize>,
    /// Frozen run parameters (batch size, resume, rotation strategy, ...)
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub counters: RunCounters,
}

impl RunManifest {
    /// First eight characters of the run id
    pub fn short_id(&self) -> &str {
        self.run_id.get(..8).unwrap_or(&self.run_id)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// What the caller asks for when starting a run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub backend: BackendKind,
    pub channels: Vec<String>,
    pub mode: ScrapeMode,
    pub sampling_interval_minutes: Option<u32>,
    pub message_limit: Option<usize>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Owns the single active manifest and persists it on `end_run`.
pub struct RunRecorder {
    db: Arc<Database>,
    artifact_dir: Option<PathBuf>,
    current: Option<RunManifest>,
}

impl RunRecorder {
    /// Recorder that writes a JSON artifact per run into `artifact_dir`
    pub fn new(db: Arc<Database>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            artifact_dir: Some(artifact_dir.into()),
            current: None,
        }
    }

    /// Recorder that only persists to the database
    pub fn without_artifacts(db: Arc<Database>) -> Self {
        Self {
            db,
            artifact_dir: None,
            current: None,
        }
    }

    /// Start a run. An unfinished previous run is finalized first.
    pub fn start_run(&mut self, request: RunRequest) -> Result<&RunManifest> {
        if let Some(previous) = self.current.as_ref() {
            tracing::warn!(
                run_id = %previous.run_id,
                "Starting a new run while another is active, finalizing the previous one"
            );
            self.end_run()?;
        }

        let manifest = RunManifest {
            run_id: uuid::Uuid::new_v4().to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            backend: request.backend,
            start_time: Utc::now(),
            end_time: None,
            channels: request.channels,
            mode: request.mode,
            sampling_interval_minutes: request.sampling_interval_minutes,
            message_limit: request.message_limit,
            parameters: request.parameters,
            counters: RunCounters::default(),
        };

        tracing::info!(
            run_id = %manifest.run_id,
            backend = %manifest.backend,
            channels = manifest.channels.len(),
            mode = manifest.mode.as_str(),
            "Run started"
        );

        Ok(self.current.insert(manifest))
    }

    pub fn current(&self) -> Option<&RunManifest> {
        self.current.as_ref()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.current.as_ref().map(|m| m.run_id.as_str())
    }

    fn counters_mut(&mut self) -> Option<&mut RunCounters> {
        self.current.as_mut().map(|m| &mut m.counters)
    }

    pub fn record_collected(&mut self, count: u64) {
        if let Some(c) = self.counters_mut() {
            c.messages_collected += count;
        }
    }

    pub fn record_skipped(&mut self) {
        if let Some(c) = self.counters_mut() {
            c.messages_skipped += 1;
        }
    }

    pub fn record_error(&mut self) {
        if let Some(c) = self.counters_mut() {
            c.errors_encountered += 1;
        }
    }

    pub fn record_flood_wait(&mut self) {
        if let Some(c) = self.counters_mut() {
            c.rate_limit_events += 1;
        }
    }

    pub fn record_proxy_rotation(&mut self) {
        if let Some(c) = self.counters_mut() {
            c.rotation_events += 1;
        }
    }

    /// Finalize the active run.
    ///
    /// Returns `None` when no run is active. The active pointer is cleared
    /// even if persisting fails.
    pub fn end_run(&mut self) -> Result<Option<RunManifest>> {
        let Some(mut manifest) = self.current.take() else {
            return Ok(None);
        };
        manifest.end_time = Some(Utc::now());

        self.db.insert_run(&manifest)?;
        if let Some(dir) = &self.artifact_dir {
            let path = write_manifest_artifact(dir, &manifest)?;
            tracing::debug!(path = %path.display(), "Manifest artifact written");
        }

        tracing::info!(
            run_id = %manifest.run_id,
            collected = manifest.counters.messages_collected,
            skipped = manifest.counters.messages_skipped,
            errors = manifest.counters.errors_encountered,
            rate_limits = manifest.counters.rate_limit_events,
            rotations = manifest.counters.rotation_events,
            "Run finished"
        );

        Ok(Some(manifest))
    }

    /// Most recent finished runs, newest first
    pub fn get_run_history(&self, limit: usize) -> Result<Vec<RunManifest>> {
        self.db.recent_runs(limit)
    }
}

/// Write `manifest_<id8>.json` into `dir`, returning its path.
pub fn write_manifest_artifact(dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("manifest_{}.json", manifest.short_id()));
    std::fs::write(&path, serde_json::to_string_pretty(manifest)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(dir: &Path) -> RunRecorder {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        RunRecorder::new(Arc::new(db), dir)
    }

    fn request() -> RunRequest {
        RunRequest {
            backend: BackendKind::Api,
            channels: vec!["news".to_string()],
            message_limit: Some(500),
            ..Default::default()
        }
    }

    #[test]
    fn test_counters_are_noops_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());
        rec.record_flood_wait();
        rec.record_error();
        rec.record_collected(10);
        assert!(rec.current().is_none());
        assert!(rec.end_run().unwrap().is_none());
    }

    #[test]
    fn test_run_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());

        let run_id = rec.start_run(request()).unwrap().run_id.clone();
        rec.record_collected(3);
        rec.record_skipped();
        rec.record_flood_wait();
        rec.record_flood_wait();
        rec.record_proxy_rotation();

        let manifest = rec.end_run().unwrap().unwrap();
        assert_eq!(manifest.run_id, run_id);
        assert!(manifest.is_finished());
        assert_eq!(manifest.counters.messages_collected, 3);
        assert_eq!(manifest.counters.messages_skipped, 1);
        assert_eq!(manifest.counters.rate_limit_events, 2);
        assert_eq!(manifest.counters.rotation_events, 1);
        assert!(rec.current().is_none());

        let artifact = dir
            .path()
            .join(format!("manifest_{}.json", manifest.short_id()));
        let written: RunManifest =
            serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(written, manifest);

        let history = rec.get_run_history(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, run_id);
    }

    #[test]
    fn test_starting_twice_finalizes_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recorder(dir.path());

        let first = rec.start_run(request()).unwrap().run_id.clone();
        let second = rec.start_run(request()).unwrap().run_id.clone();
        assert_ne!(first, second);
        assert_eq!(rec.run_id(), Some(second.as_str()));

        let history = rec.get_run_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, first);
    }
}
