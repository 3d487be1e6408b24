//! Core domain types for chanwatch
//!
//! These types are the normalized shape every source backend produces and
//! every downstream component consumes.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Channel** | A public, append-mostly message stream identified by a name |
//! | **Backend** | The concrete way messages are fetched (API session, web preview, mirror feed) |
//! | **MessageRecord** | One normalized message with collection metadata |
//! | **Continuity** | What we know about each message id over time (observed, edited, deleted, ...) |
//! | **Checkpoint** | The persisted resume position for a channel |
//!
//! ### Authoritative vs inferred ids
//!
//! Only some backends expose the platform's own message ids. Others scrape an
//! id-like token out of a link, and some expose nothing. [`IdProvenance`]
//! travels on every record so gap and deletion inference can refuse to run on
//! ids that were never promised to be contiguous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// ============================================
// Backends and modes
// ============================================

/// The closed set of source backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Authenticated API session; full capability
    #[default]
    Api,
    /// Public web preview pages; degraded capability
    Web,
    /// Syndication mirror feed; lowest capability
    Mirror,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Api => "api",
            BackendKind::Web => "web",
            BackendKind::Mirror => "mirror",
        }
    }

    /// All backends, in descending capability order
    pub fn all() -> [BackendKind; 3] {
        [BackendKind::Api, BackendKind::Web, BackendKind::Mirror]
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(BackendKind::Api),
            "web" => Ok(BackendKind::Web),
            "mirror" | "rss" => Ok(BackendKind::Mirror),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// How a run was scoped; recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMode {
    /// Continue from stored checkpoints
    #[default]
    Incremental,
    /// Ignore checkpoints and fetch everything reachable
    Full,
    /// Periodic sample at a fixed interval
    Sample,
}

impl ScrapeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeMode::Incremental => "incremental",
            ScrapeMode::Full => "full",
            ScrapeMode::Sample => "sample",
        }
    }
}

impl std::str::FromStr for ScrapeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(ScrapeMode::Incremental),
            "full" => Ok(ScrapeMode::Full),
            "sample" => Ok(ScrapeMode::Sample),
            _ => Err(format!("unknown scrape mode: {}", s)),
        }
    }
}

// ============================================
// Channels
// ============================================

/// A resolved channel handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Stable numeric id (platform id, or a name-derived id for backends without one)
    pub id: i64,
    /// Public username, without a leading `@`
    pub name: String,
}

impl ChannelRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Derive a stable id from a channel name for backends that expose none.
    pub fn from_name(name: &str) -> Self {
        let normalized = normalize_channel_name(name);
        let digest = Sha256::digest(normalized.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        // Keep the id positive so it never collides with sentinel values.
        let id = (u64::from_be_bytes(bytes) >> 1) as i64;
        Self { id, name: normalized }
    }
}

/// Strip URL prefixes and `@` from a user-supplied channel name.
pub fn normalize_channel_name(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    let tail = trimmed.rsplit('/').next().unwrap_or(trimmed);
    tail.trim_start_matches('@').to_string()
}

/// Descriptive channel metadata, when the backend exposes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: Option<i64>,
    pub name: String,
    pub title: Option<String>,
    pub about: Option<String>,
    pub participants: Option<u64>,
}

// ============================================
// Messages
// ============================================

/// Where a record's message id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdProvenance {
    /// Platform-assigned, contiguous per channel
    Authoritative,
    /// Parsed out of a link or markup; may skip or repeat
    Inferred,
    /// Backend exposes no id at all
    Absent,
}

impl IdProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdProvenance::Authoritative => "authoritative",
            IdProvenance::Inferred => "inferred",
            IdProvenance::Absent => "absent",
        }
    }
}

impl std::str::FromStr for IdProvenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authoritative" => Ok(IdProvenance::Authoritative),
            "inferred" => Ok(IdProvenance::Inferred),
            "absent" => Ok(IdProvenance::Absent),
            _ => Err(format!("unknown id provenance: {}", s)),
        }
    }
}

/// One reaction label and its count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub label: String,
    pub count: u64,
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Other,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Other => "other",
        }
    }

    /// Best-effort kind from a MIME type or a loose label.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        if lower.starts_with("image") || lower == "photo" {
            MediaKind::Photo
        } else if lower.starts_with("video") || lower == "gif" {
            MediaKind::Video
        } else if lower.starts_with("audio") || lower == "voice" {
            MediaKind::Audio
        } else if lower.starts_with("application") || lower == "document" || lower == "file" {
            MediaKind::Document
        } else {
            MediaKind::Other
        }
    }

    /// File extension used when the source URL has none.
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
            MediaKind::Audio => "ogg",
            MediaKind::Document | MediaKind::Other => "bin",
        }
    }
}

/// Reference to one attached media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    /// Download URL, when the backend provides one
    pub url: Option<String>,
    pub mime_type: Option<String>,
}

/// A normalized message.
///
/// Engagement counters are `Some(0)` when the backend supports them and the
/// upstream omitted the field, and `None` when the backend cannot observe
/// them at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: i64,
    pub channel_name: String,
    pub message_id: Option<i64>,
    pub id_provenance: IdProvenance,
    pub posted_at: DateTime<Utc>,
    pub text: String,
    pub views: Option<u64>,
    pub forwards: Option<u64>,
    pub reply_count: Option<u64>,
    pub reactions: Vec<Reaction>,
    pub media: Vec<MediaRef>,
    /// Source channel name or id when the message is a forward
    pub forwarded_from: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
    pub backend: BackendKind,
    pub collected_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// Message id only when it is the platform's own.
    pub fn authoritative_id(&self) -> Option<i64> {
        match self.id_provenance {
            IdProvenance::Authoritative => self.message_id,
            IdProvenance::Inferred | IdProvenance::Absent => None,
        }
    }

    /// Content fingerprint used to dedupe records without a reliable id.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.text, &self.posted_at, self.message_id)
    }

    /// Short checksum of the text, compared across observations to detect edits.
    pub fn content_checksum(&self) -> String {
        content_checksum(&self.text)
    }

    /// Key under which the record is persisted.
    ///
    /// Reliable ids dedupe on the id; everything else dedupes on content.
    pub fn store_key(&self) -> String {
        match self.authoritative_id() {
            Some(id) => format!("id:{}", id),
            None => format!("fp:{}", self.fingerprint()),
        }
    }
}

/// SHA-256 of `text|timestamp|id`, hex encoded.
pub fn fingerprint(text: &str, posted_at: &DateTime<Utc>, message_id: Option<i64>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(posted_at.to_rfc3339().as_bytes());
    hasher.update(b"|");
    if let Some(id) = message_id {
        hasher.update(id.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// First 16 hex chars of SHA-256 over the text.
pub fn content_checksum(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    digest[..16].to_string()
}

/// Unique forward sources in first-seen order.
pub fn discovered_forwards(records: &[MessageRecord]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    records
        .iter()
        .filter_map(|r| r.forwarded_from.as_ref())
        .filter(|source| seen.insert(source.as_str()))
        .cloned()
        .collect()
}

// ============================================
// Continuity
// ============================================

/// Status of a message id in the continuity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Observed,
    Edited,
    Deleted,
    Inaccessible,
    Unknown,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Observed => "observed",
            MessageStatus::Edited => "edited",
            MessageStatus::Deleted => "deleted",
            MessageStatus::Inaccessible => "inaccessible",
            MessageStatus::Unknown => "unknown",
        }
    }

    /// Whether the id has been seen with content at least once.
    pub fn was_seen(&self) -> bool {
        matches!(
            self,
            MessageStatus::Observed | MessageStatus::Edited | MessageStatus::Deleted
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(MessageStatus::Observed),
            "edited" => Ok(MessageStatus::Edited),
            "deleted" => Ok(MessageStatus::Deleted),
            "inaccessible" => Ok(MessageStatus::Inaccessible),
            "unknown" => Ok(MessageStatus::Unknown),
            _ => Err(format!("unknown message status: {}", s)),
        }
    }
}

/// Current continuity state for one `(channel, message id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityRecord {
    pub channel_id: i64,
    pub message_id: i64,
    /// Seen with content at least once
    pub observed: bool,
    pub status: MessageStatus,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
}

/// One append-only entry in a message's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub channel_id: i64,
    pub message_id: i64,
    pub status: MessageStatus,
    pub observed_at: DateTime<Utc>,
    pub content_checksum: Option<String>,
    pub content_length: Option<usize>,
    pub run_id: Option<String>,
}

// ============================================
// Checkpoints
// ============================================

/// Persisted resume position for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub channel_id: i64,
    pub channel_name: String,
    /// Lower bound for the next fetch (exclusive)
    pub last_message_id: Option<i64>,
    pub messages_collected: u64,
    pub batches_flushed: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: Option<i64>, provenance: IdProvenance, text: &str) -> MessageRecord {
        MessageRecord {
            channel_id: 1,
            channel_name: "news".to_string(),
            message_id: id,
            id_provenance: provenance,
            posted_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            text: text.to_string(),
            views: Some(0),
            forwards: Some(0),
            reply_count: Some(0),
            reactions: vec![],
            media: vec![],
            forwarded_from: None,
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Api,
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn test_backend_kind_roundtrip() {
        for kind in BackendKind::all() {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("rss".parse::<BackendKind>().unwrap(), BackendKind::Mirror);
        assert!("telegraph".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_store_key_depends_on_provenance() {
        let reliable = record(Some(42), IdProvenance::Authoritative, "hello");
        assert_eq!(reliable.store_key(), "id:42");

        let inferred = record(Some(42), IdProvenance::Inferred, "hello");
        assert!(inferred.store_key().starts_with("fp:"));
        assert_eq!(inferred.authoritative_id(), None);
    }

    #[test]
    fn test_fingerprint_is_content_sensitive() {
        let a = record(Some(1), IdProvenance::Inferred, "hello");
        let b = record(Some(1), IdProvenance::Inferred, "hello");
        let c = record(Some(1), IdProvenance::Inferred, "hello!");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_content_checksum_length() {
        let sum = content_checksum("some text");
        assert_eq!(sum.len(), 16);
        assert_eq!(sum, content_checksum("some text"));
        assert_ne!(sum, content_checksum("some text."));
    }

    #[test]
    fn test_channel_ref_from_name_is_stable() {
        let a = ChannelRef::from_name("@durov");
        let b = ChannelRef::from_name("https://t.me/durov");
        assert_eq!(a, b);
        assert_eq!(a.name, "durov");
        assert!(a.id > 0);
    }

    #[test]
    fn test_discovered_forwards_dedupes_in_order() {
        let mut a = record(Some(1), IdProvenance::Authoritative, "a");
        a.forwarded_from = Some("alpha".to_string());
        let mut b = record(Some(2), IdProvenance::Authoritative, "b");
        b.forwarded_from = Some("beta".to_string());
        let mut c = record(Some(3), IdProvenance::Authoritative, "c");
        c.forwarded_from = Some("alpha".to_string());
        let d = record(Some(4), IdProvenance::Authoritative, "d");

        assert_eq!(discovered_forwards(&[a, b, c, d]), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_media_kind_from_label() {
        assert_eq!(MediaKind::from_label("image/jpeg"), MediaKind::Photo);
        assert_eq!(MediaKind::from_label("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_label("document"), MediaKind::Document);
        assert_eq!(MediaKind::from_label("sticker"), MediaKind::Other);
    }
}
