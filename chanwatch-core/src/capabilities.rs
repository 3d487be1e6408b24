//! Backend capability declarations
//!
//! Every source backend declares what it can and cannot observe. The
//! declaration gates features at runtime (resume, media download, gap
//! inference) and is disclosed verbatim in bias reports.

use crate::types::BackendKind;
use serde::{Deserialize, Serialize};

/// How far derived bias metrics can be trusted for a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BiasConfidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl BiasConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            BiasConfidence::None => "none",
            BiasConfidence::Low => "low",
            BiasConfidence::Medium => "medium",
            BiasConfidence::High => "high",
        }
    }

    /// One tier lower, saturating at `None`.
    pub fn downgraded(self) -> Self {
        match self {
            BiasConfidence::High => BiasConfidence::Medium,
            BiasConfidence::Medium => BiasConfidence::Low,
            BiasConfidence::Low | BiasConfidence::None => BiasConfidence::None,
        }
    }
}

impl std::fmt::Display for BiasConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    // Access
    pub public_channels: bool,
    pub private_channels: bool,
    pub message_text: bool,
    pub message_timestamps: bool,

    // Engagement and metadata
    pub views: bool,
    pub forwards: bool,
    pub reactions: bool,
    pub replies: bool,
    pub sender_info: bool,

    // Media
    pub media_urls: bool,
    pub media_download: bool,

    // Continuity
    pub resume_by_id: bool,
    pub edit_detection: bool,
    pub deletion_detection: bool,
    pub message_id_reliable: bool,

    // Discovery
    pub forward_source_detection: bool,
    pub snowball_discovery: bool,

    pub bias_tracking_supported: bool,
    pub bias_confidence: BiasConfidence,
}

type FlagCheck = fn(&Capabilities) -> bool;

/// Caveats in report order. Reports are diffed across runs, so this order is fixed.
const LIMITATIONS: &[(FlagCheck, &str)] = &[
    (|c| c.private_channels, "Public channels only"),
    (
        |c| c.message_id_reliable,
        "Message IDs inferred, not authoritative",
    ),
    (|c| c.edit_detection, "Edits not observable"),
    (|c| c.deletion_detection, "Deletions not detectable"),
    (|c| c.reactions, "Reactions not captured"),
    (|c| c.views, "View counts unavailable or inaccurate"),
    (|c| c.media_download, "Media download not supported"),
    (|c| c.resume_by_id, "Resume by message ID not reliable"),
    (|c| c.sender_info, "Sender information not available"),
];

impl Capabilities {
    /// Authenticated API session.
    pub const FULL: Capabilities = Capabilities {
        public_channels: true,
        private_channels: true,
        message_text: true,
        message_timestamps: true,
        views: true,
        forwards: true,
        reactions: true,
        replies: true,
        sender_info: true,
        media_urls: true,
        media_download: true,
        resume_by_id: true,
        edit_detection: true,
        deletion_detection: true,
        message_id_reliable: true,
        forward_source_detection: true,
        snowball_discovery: true,
        bias_tracking_supported: true,
        bias_confidence: BiasConfidence::High,
    };

    /// Public web preview pages.
    pub const WEB: Capabilities = Capabilities {
        public_channels: true,
        private_channels: false,
        message_text: true,
        message_timestamps: true,
        views: false,
        forwards: false,
        reactions: false,
        replies: false,
        sender_info: false,
        media_urls: true,
        media_download: false,
        resume_by_id: false,
        edit_detection: false,
        deletion_detection: false,
        message_id_reliable: false,
        forward_source_detection: true,
        snowball_discovery: true,
        bias_tracking_supported: false,
        bias_confidence: BiasConfidence::Low,
    };

    /// Third-party syndication mirror.
    pub const MIRROR: Capabilities = Capabilities {
        public_channels: true,
        private_channels: false,
        message_text: true,
        message_timestamps: true,
        views: false,
        forwards: false,
        reactions: false,
        replies: false,
        sender_info: false,
        media_urls: true,
        media_download: false,
        resume_by_id: false,
        edit_detection: false,
        deletion_detection: false,
        message_id_reliable: false,
        forward_source_detection: false,
        snowball_discovery: false,
        bias_tracking_supported: false,
        bias_confidence: BiasConfidence::None,
    };

    /// The declaration for a backend kind.
    pub fn for_backend(kind: BackendKind) -> Capabilities {
        match kind {
            BackendKind::Api => Self::FULL,
            BackendKind::Web => Self::WEB,
            BackendKind::Mirror => Self::MIRROR,
        }
    }

    /// Human-readable caveats, one per unset flag, in a fixed order.
    pub fn limitations(&self) -> Vec<&'static str> {
        LIMITATIONS
            .iter()
            .filter(|(has, _)| !has(self))
            .map(|(_, caveat)| *caveat)
            .collect()
    }

    /// Confidence to attach to metrics computed from this backend's data.
    ///
    /// Gap and deletion counts are only meaningful over authoritative ids.
    pub fn metrics_confidence(&self) -> BiasConfidence {
        if self.message_id_reliable {
            self.bias_confidence
        } else {
            self.bias_confidence.downgraded()
        }
    }

    /// Media can be fetched at all, either directly or via exposed URLs.
    pub fn media_reachable(&self) -> bool {
        self.media_download || self.media_urls
    }

    /// Disclosure block for reports on data from `kind`.
    pub fn bias_disclosure(kind: BackendKind) -> BiasDisclosure {
        BiasDisclosure::for_backend(kind)
    }
}

/// Disclosure block embedded in every export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasDisclosure {
    pub backend: BackendKind,
    pub bias_confidence: BiasConfidence,
    pub capabilities: Capabilities,
    pub known_limitations: Vec<String>,
    pub disclaimer: String,
}

impl BiasDisclosure {
    pub fn for_backend(kind: BackendKind) -> Self {
        let capabilities = Capabilities::for_backend(kind);
        Self {
            backend: kind,
            bias_confidence: capabilities.bias_confidence,
            known_limitations: capabilities
                .limitations()
                .into_iter()
                .map(String::from)
                .collect(),
            capabilities,
            disclaimer: disclaimer(kind).to_string(),
        }
    }
}

/// Provenance statement for data collected through a backend.
pub fn disclaimer(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Api => {
            "Data collected via the platform's authenticated API. \
             Subject to standard API limitations and rate controls."
        }
        BackendKind::Web => {
            "Data collected from the public web preview. \
             Message IDs are inferred and may not be authoritative. \
             Edit history, reactions, and accurate view counts are not available. \
             This data should be treated as observational, not archival."
        }
        BackendKind::Mirror => {
            "Data ingested from third-party feeds or mirrors. \
             Completeness, accuracy, and timeliness cannot be guaranteed. \
             This is secondary source data."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_backend_has_no_limitations() {
        assert!(Capabilities::FULL.limitations().is_empty());
        assert_eq!(
            Capabilities::FULL.metrics_confidence(),
            BiasConfidence::High
        );
    }

    #[test]
    fn test_web_limitations_are_ordered() {
        assert_eq!(
            Capabilities::WEB.limitations(),
            vec![
                "Public channels only",
                "Message IDs inferred, not authoritative",
                "Edits not observable",
                "Deletions not detectable",
                "Reactions not captured",
                "View counts unavailable or inaccurate",
                "Media download not supported",
                "Resume by message ID not reliable",
                "Sender information not available",
            ]
        );
    }

    #[test]
    fn test_partial_limitations_keep_table_order() {
        let caps = Capabilities {
            views: false,
            private_channels: false,
            ..Capabilities::FULL
        };
        assert_eq!(
            caps.limitations(),
            vec![
                "Public channels only",
                "View counts unavailable or inaccurate"
            ]
        );
    }

    #[test]
    fn test_unreliable_ids_downgrade_confidence() {
        let caps = Capabilities {
            message_id_reliable: false,
            ..Capabilities::FULL
        };
        assert_eq!(caps.metrics_confidence(), BiasConfidence::Medium);
        assert_eq!(Capabilities::WEB.metrics_confidence(), BiasConfidence::None);
        assert_eq!(
            Capabilities::MIRROR.metrics_confidence(),
            BiasConfidence::None
        );
    }

    #[test]
    fn test_disclosure_matches_declaration() {
        let disclosure = Capabilities::bias_disclosure(BackendKind::Web);
        assert_eq!(disclosure.bias_confidence, BiasConfidence::Low);
        assert_eq!(disclosure.known_limitations.len(), 9);
        assert!(disclosure.disclaimer.contains("inferred"));

        let json = serde_json::to_value(&disclosure).unwrap();
        assert_eq!(json["backend"], "web");
        assert_eq!(json["capabilities"]["message_id_reliable"], false);
    }
}
