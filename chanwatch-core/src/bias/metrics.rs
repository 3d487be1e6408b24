//! Derived bias metrics and the methodology statement.

use crate::capabilities::BiasConfidence;
use crate::types::BackendKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Completeness metrics for one channel, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasMetrics {
    pub channel_id: i64,
    pub channel_name: String,
    pub backend: BackendKind,
    pub bias_confidence: BiasConfidence,
    pub ids_authoritative: bool,

    pub expected_message_count: u64,
    pub observed_count: u64,
    pub gap_count: u64,
    pub deleted_count: u64,
    pub edited_count: u64,
    /// Gaps never seen at all (unknown or inaccessible)
    pub possibly_deleted_count: u64,

    pub oldest_message: Option<DateTime<Utc>>,
    pub newest_message: Option<DateTime<Utc>>,
    pub collection_start: Option<DateTime<Utc>>,
    pub collection_end: Option<DateTime<Utc>>,
    pub avg_collection_latency_secs: Option<f64>,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

impl BiasMetrics {
    /// Empty metrics for a channel with nothing tracked yet
    pub fn empty(channel_id: i64, channel_name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            channel_id,
            channel_name: channel_name.into(),
            backend,
            bias_confidence: BiasConfidence::None,
            ids_authoritative: false,
            expected_message_count: 0,
            observed_count: 0,
            gap_count: 0,
            deleted_count: 0,
            edited_count: 0,
            possibly_deleted_count: 0,
            oldest_message: None,
            newest_message: None,
            collection_start: None,
            collection_end: None,
            avg_collection_latency_secs: None,
        }
    }

    pub fn gap_ratio(&self) -> f64 {
        ratio(self.gap_count, self.expected_message_count)
    }

    pub fn coverage_rate(&self) -> f64 {
        ratio(self.observed_count, self.expected_message_count)
    }

    pub fn deletion_rate(&self) -> f64 {
        ratio(self.deleted_count, self.observed_count)
    }

    pub fn edit_rate(&self) -> f64 {
        ratio(self.edited_count, self.observed_count)
    }

    /// Export shape with ratios rounded to four places.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "channel_id": self.channel_id,
            "channel_name": self.channel_name,
            "backend": self.backend,
            "bias_confidence": self.bias_confidence,
            "ids_authoritative": self.ids_authoritative,
            "expected_message_count": self.expected_message_count,
            "observed_count": self.observed_count,
            "gap_count": self.gap_count,
            "deleted_count": self.deleted_count,
            "edited_count": self.edited_count,
            "possibly_deleted_count": self.possibly_deleted_count,
            "gap_ratio": round4(self.gap_ratio()),
            "coverage_rate": round4(self.coverage_rate()),
            "deletion_rate": round4(self.deletion_rate()),
            "edit_rate": round4(self.edit_rate()),
            "oldest_message": self.oldest_message,
            "newest_message": self.newest_message,
            "collection_start": self.collection_start,
            "collection_end": self.collection_end,
            "avg_collection_latency_secs": self.avg_collection_latency_secs,
        })
    }

    /// Plain-language summary for inclusion in reports.
    ///
    /// Clauses whose underlying count is zero are left out.
    pub fn methodology_statement(&self) -> String {
        let mut sentences = Vec::new();

        match (self.collection_start, self.collection_end) {
            (Some(start), Some(end)) => sentences.push(format!(
                "Data collection for channel '{}' occurred between {} and {}.",
                self.channel_name,
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            )),
            _ => sentences.push(format!(
                "Data collection for channel '{}' has no recorded observation window.",
                self.channel_name
            )),
        }

        if !self.ids_authoritative {
            sentences.push(format!(
                "Message IDs from the {} backend are inferred, so no gap or deletion figures \
                 are derived (confidence: {}).",
                self.backend, self.bias_confidence
            ));
        } else if self.expected_message_count == 0 {
            sentences.push("No message ID range has been established yet.".to_string());
        } else if self.gap_count == 0 {
            sentences.push(format!(
                "All {} message IDs within the observed range were available at collection time.",
                self.expected_message_count
            ));
        } else {
            sentences.push(format!(
                "Approximately {} of message IDs within the observed range were unavailable at \
                 collection time, consistent with deletion or access restrictions.",
                percent(self.gap_ratio())
            ));
        }

        if self.deleted_count > 0 {
            sentences.push(format!(
                "The confirmed deletion rate was {}.",
                percent(self.deletion_rate())
            ));
        }

        if self.edited_count > 0 {
            sentences.push(format!(
                "Approximately {} of collected messages showed evidence of post-publication editing.",
                percent(self.edit_rate())
            ));
        }

        if let Some(latency) = self.avg_collection_latency_secs.filter(|l| *l > 0.0) {
            sentences.push(format!(
                "Average sampling latency was {:.1} hours, which may underrepresent short-lived content.",
                latency / 3600.0
            ));
        }

        sentences.join(" ")
    }
}
