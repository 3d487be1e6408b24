//! Continuity and bias tracking
//!
//! - [`ContinuityTracker`] records observations, gaps, edits and deletions
//! - [`RunRecorder`] keeps the manifest of the active run
//! - [`BiasMetrics`] and [`BiasReport`] turn persisted state into disclosures
//!
//! Both stateful pieces live in a [`RunContext`] that is created for one run,
//! passed to the fetch loop, and finalized at the end.

mod manifest;
mod metrics;
mod report;
mod tracker;

pub use manifest::{write_manifest_artifact, RunCounters, RunManifest, RunRecorder, RunRequest};
pub use metrics::BiasMetrics;
pub use report::{build_bias_report, export_bias_report, BiasReport, REPORT_RECENT_RUNS};
pub use tracker::{compute_metrics, ContinuityTracker, Observation};

use crate::db::Database;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-run state shared by the fetch loop and reporting.
pub struct RunContext {
    pub tracker: ContinuityTracker,
    pub recorder: RunRecorder,
}

impl RunContext {
    /// Context that writes manifest artifacts into `artifact_dir`
    pub fn new(db: Arc<Database>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracker: ContinuityTracker::new(Arc::clone(&db)),
            recorder: RunRecorder::new(db, artifact_dir),
        }
    }

    /// Context that only persists manifests to the database
    pub fn in_database(db: Arc<Database>) -> Self {
        Self {
            tracker: ContinuityTracker::new(Arc::clone(&db)),
            recorder: RunRecorder::without_artifacts(db),
        }
    }

    /// Start a run and tag continuity history with its id
    pub fn start_run(&mut self, request: RunRequest) -> Result<&RunManifest> {
        let run_id = self.recorder.start_run(request)?.run_id.clone();
        self.tracker.set_run_id(Some(run_id));
        self.recorder.current().ok_or_else(|| {
            crate::error::Error::Config("run ended while starting".to_string())
        })
    }

    /// Finalize the active run
    pub fn end_run(&mut self) -> Result<Option<RunManifest>> {
        self.tracker.set_run_id(None);
        self.recorder.end_run()
    }
}
