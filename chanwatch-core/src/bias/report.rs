//! Bias report export.

use super::manifest::RunManifest;
use super::tracker::compute_metrics;
use crate::capabilities::{BiasDisclosure, Capabilities};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::ChannelRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runs included in a report
pub const REPORT_RECENT_RUNS: usize = 5;

/// Structured bias report for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasReport {
    pub generated_at: DateTime<Utc>,
    pub channel: ChannelRef,
    pub disclosure: BiasDisclosure,
    pub metrics: serde_json::Value,
    pub methodology_statement: String,
    pub recent_runs: Vec<RunManifest>,
}

/// Build a report for a registered channel.
pub fn build_bias_report(db: &Database, channel_id: i64) -> Result<BiasReport> {
    let stored = db
        .get_channel(channel_id)?
        .ok_or_else(|| Error::ChannelInvalid(format!("#{}", channel_id)))?;

    let metrics = compute_metrics(
        db,
        channel_id,
        stored.channel.name.clone(),
        stored.backend,
    )?;

    Ok(BiasReport {
        generated_at: Utc::now(),
        disclosure: Capabilities::bias_disclosure(stored.backend),
        metrics: metrics.to_json(),
        methodology_statement: metrics.methodology_statement(),
        recent_runs: db.recent_runs_for_channel(&stored.channel.name, REPORT_RECENT_RUNS)?,
        channel: stored.channel,
    })
}

/// Build a report and write it as pretty JSON to `path`.
pub fn export_bias_report(db: &Database, channel_id: i64, path: &Path) -> Result<BiasReport> {
    let report = build_bias_report(db, channel_id)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
    tracing::info!(
        channel = %report.channel.name,
        path = %path.display(),
        "Bias report exported"
    );
    Ok(report)
}
