//! Degraded adapter over a channel's public web preview
//!
//! Items are what a markup scraper can extract, so ids are inferred from the
//! `data-post` token and nothing about engagement is trustworthy:
//!
//! ```json
//! {"post": "news/123", "datetime": "2024-03-01T10:00:00+00:00", "text": "...",
//!  "media_urls": ["https://cdn/a.jpg"], "forwarded_from": "@origin", "views": "1.2K"}
//! ```

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;

use super::transport::Transport;
use super::{str_field, timestamp_field};
use crate::error::{Error, Result};
use crate::types::{
    fingerprint, normalize_channel_name, BackendKind, ChannelInfo, ChannelRef, IdProvenance,
    MediaKind, MediaRef, MessageRecord,
};

pub struct WebAdapter {
    pub(super) transport: Box<dyn Transport>,
    /// Fingerprints emitted in the current paging session
    seen: HashSet<String>,
}

impl WebAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            seen: HashSet::new(),
        }
    }

    /// Forget fingerprints from the previous paging session
    pub(super) fn reset_session(&mut self) {
        self.seen.clear();
    }

    /// Normalize one item, returning `None` for a repeat within the session.
    pub(super) fn normalize(
        &mut self,
        channel: &ChannelRef,
        raw: &Value,
    ) -> Result<Option<MessageRecord>> {
        let message_id = str_field(raw, "post").and_then(post_id);
        let posted_at = timestamp_field(raw, "datetime").ok_or_else(|| {
            Error::normalize("web", format!("post {:?} has no datetime", message_id))
        })?;
        let text = str_field(raw, "text").unwrap_or_default().to_string();

        if !self.seen.insert(fingerprint(&text, &posted_at, message_id)) {
            tracing::trace!(channel = %channel.name, ?message_id, "Skipping repeated web post");
            return Ok(None);
        }

        let media = raw
            .get("media_urls")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(|url| MediaRef {
                        kind: kind_from_url(url),
                        url: Some(url.to_string()),
                        mime_type: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(MessageRecord {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            message_id,
            id_provenance: if message_id.is_some() {
                IdProvenance::Inferred
            } else {
                IdProvenance::Absent
            },
            posted_at,
            text,
            // View counters in the preview are rounded; replies and reactions are absent.
            views: None,
            forwards: None,
            reply_count: None,
            reactions: Vec::new(),
            media,
            forwarded_from: str_field(raw, "forwarded_from")
                .map(normalize_channel_name)
                .filter(|name| !name.is_empty()),
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Web,
            collected_at: Utc::now(),
        }))
    }

    pub(super) fn channel_info(channel: &str, raw: &Value) -> ChannelInfo {
        ChannelInfo {
            id: None,
            name: channel.to_string(),
            title: str_field(raw, "title").map(String::from),
            about: str_field(raw, "description")
                .or_else(|| str_field(raw, "about"))
                .map(String::from),
            participants: str_field(raw, "subscribers").and_then(parse_compact_count),
        }
    }
}

/// Id from a `channel/123` post token.
fn post_id(token: &str) -> Option<i64> {
    token.rsplit('/').next()?.parse().ok()
}

fn kind_from_url(url: &str) -> MediaKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "webp" | "gif" => MediaKind::Photo,
        "mp4" | "webm" | "mov" => MediaKind::Video,
        "ogg" | "oga" | "mp3" | "m4a" => MediaKind::Audio,
        "pdf" | "zip" | "doc" | "docx" => MediaKind::Document,
        _ => MediaKind::Other,
    }
}

/// Parse preview counters such as `1.2K`, `3M` or `12 345`.
pub fn parse_compact_count(text: &str) -> Option<u64> {
    let cleaned: String = text
        .split_whitespace()
        .next()
        .map(|first| {
            // "12 345 subscribers" groups digits with spaces
            let mut digits = first.to_string();
            for part in text.split_whitespace().skip(1) {
                if part.chars().all(|c| c.is_ascii_digit()) {
                    digits.push_str(part);
                } else {
                    break;
                }
            }
            digits
        })?
        .replace(',', "");

    let (number, multiplier) = match cleaned.chars().last()? {
        'K' | 'k' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'M' | 'm' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    let value: f64 = number.parse().ok()?;
    if value.is_sign_negative() || !value.is_finite() {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::NullTransport;
    use serde_json::json;

    fn adapter() -> WebAdapter {
        WebAdapter::new(Box::new(NullTransport))
    }

    #[test]
    fn test_inferred_ids_and_no_engagement() {
        let mut web = adapter();
        let channel = ChannelRef::from_name("news");
        let record = web
            .normalize(
                &channel,
                &json!({
                    "post": "news/123",
                    "datetime": "2024-03-01T10:00:00+00:00",
                    "text": "hi",
                    "views": "1.2K",
                    "media_urls": ["https://cdn/a.JPG?x=1", "https://cdn/b.mp4"],
                    "forwarded_from": "https://t.me/origin"
                }),
            )
            .unwrap()
            .unwrap();

        assert_eq!(record.message_id, Some(123));
        assert_eq!(record.id_provenance, IdProvenance::Inferred);
        assert_eq!(record.authoritative_id(), None);
        assert_eq!(record.views, None);
        assert_eq!(record.media[0].kind, MediaKind::Photo);
        assert_eq!(record.media[1].kind, MediaKind::Video);
        assert_eq!(record.forwarded_from.as_deref(), Some("origin"));
        assert!(record.store_key().starts_with("fp:"));
    }

    #[test]
    fn test_session_dedup_by_fingerprint() {
        let mut web = adapter();
        let channel = ChannelRef::from_name("news");
        let raw = json!({"post": "news/7", "datetime": "2024-03-01T10:00:00Z", "text": "a"});

        assert!(web.normalize(&channel, &raw).unwrap().is_some());
        assert!(web.normalize(&channel, &raw).unwrap().is_none());

        // Same inferred id with different content is a distinct post
        let drifted = json!({"post": "news/7", "datetime": "2024-03-01T10:00:00Z", "text": "b"});
        assert!(web.normalize(&channel, &drifted).unwrap().is_some());

        web.reset_session();
        assert!(web.normalize(&channel, &raw).unwrap().is_some());
    }

    #[test]
    fn test_missing_post_token_is_absent() {
        let mut web = adapter();
        let record = web
            .normalize(
                &ChannelRef::from_name("news"),
                &json!({"datetime": "2024-03-01T10:00:00Z", "text": "x"}),
            )
            .unwrap()
            .unwrap();
        assert_eq!(record.message_id, None);
        assert_eq!(record.id_provenance, IdProvenance::Absent);

        assert!(web
            .normalize(&ChannelRef::from_name("news"), &json!({"post": "news/1"}))
            .is_err());
    }

    #[test]
    fn test_parse_compact_count() {
        assert_eq!(parse_compact_count("1.2K"), Some(1200));
        assert_eq!(parse_compact_count("3M subscribers"), Some(3_000_000));
        assert_eq!(parse_compact_count("12 345 subscribers"), Some(12345));
        assert_eq!(parse_compact_count("1,024"), Some(1024));
        assert_eq!(parse_compact_count("many"), None);
        assert_eq!(parse_compact_count(""), None);
    }

    #[test]
    fn test_channel_info() {
        let info = WebAdapter::channel_info(
            "news",
            &json!({"title": "News", "description": "daily", "subscribers": "12.3K"}),
        );
        assert_eq!(info.id, None);
        assert_eq!(info.about.as_deref(), Some("daily"));
        assert_eq!(info.participants, Some(12300));
    }
}
