//! Full-fidelity API adapter
//!
//! Items carry platform-assigned ids and full engagement data:
//!
//! ```json
//! {"id": 101, "date": "2024-03-01T10:00:00Z", "message": "...",
//!  "views": 10, "forwards": 2, "replies": 1,
//!  "reactions": [{"emoji": "👍", "count": 3}],
//!  "media": [{"type": "photo", "url": "...", "mime_type": "image/jpeg"}],
//!  "fwd_from": "otherchannel", "edit_date": 1709290000, "pinned": false}
//! ```

use chrono::Utc;
use serde_json::Value;

use super::transport::Transport;
use super::{media_refs, str_field, timestamp_field, u64_field};
use crate::error::{Error, Result};
use crate::types::{BackendKind, ChannelInfo, ChannelRef, IdProvenance, MessageRecord, Reaction};

pub struct ApiAdapter {
    pub(super) transport: Box<dyn Transport>,
}

impl ApiAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub(super) fn normalize(channel: &ChannelRef, raw: &Value) -> Result<MessageRecord> {
        let message_id = raw
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::normalize("api", "item has no numeric id"))?;
        let posted_at = timestamp_field(raw, "date").ok_or_else(|| {
            Error::normalize_item("api", message_id, format!("message {} has no date", message_id))
        })?;

        let text = str_field(raw, "message")
            .or_else(|| str_field(raw, "text"))
            .unwrap_or_default()
            .to_string();

        Ok(MessageRecord {
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            message_id: Some(message_id),
            id_provenance: IdProvenance::Authoritative,
            posted_at,
            text,
            views: Some(u64_field(raw, "views").unwrap_or(0)),
            forwards: Some(u64_field(raw, "forwards").unwrap_or(0)),
            reply_count: Some(u64_field(raw, "replies").unwrap_or(0)),
            reactions: reactions(raw),
            media: media_refs(raw.get("media")),
            forwarded_from: forward_source(raw.get("fwd_from")),
            edited_at: timestamp_field(raw, "edit_date"),
            is_pinned: raw.get("pinned").and_then(Value::as_bool).unwrap_or(false),
            backend: BackendKind::Api,
            collected_at: Utc::now(),
        })
    }

    pub(super) fn channel_info(channel: &str, raw: &Value) -> ChannelInfo {
        ChannelInfo {
            id: raw.get("id").and_then(Value::as_i64),
            name: str_field(raw, "username").unwrap_or(channel).to_string(),
            title: str_field(raw, "title").map(String::from),
            about: str_field(raw, "about").map(String::from),
            participants: u64_field(raw, "participants_count"),
        }
    }
}

fn reactions(raw: &Value) -> Vec<Reaction> {
    let Some(items) = raw.get("reactions").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let label = str_field(item, "emoji").or_else(|| str_field(item, "label"))?;
            Some(Reaction {
                label: label.to_string(),
                count: u64_field(item, "count").unwrap_or(0),
            })
        })
        .collect()
}

fn forward_source(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(name) if !name.is_empty() => Some(name.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(map) => map
            .get("from_name")
            .or_else(|| map.get("channel_id"))
            .and_then(|v| forward_source(Some(v))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;
    use chrono::TimeZone;
    use serde_json::json;

    fn channel() -> ChannelRef {
        ChannelRef::new(777, "news")
    }

    #[test]
    fn test_normalize_full_item() {
        let raw = json!({
            "id": 101,
            "date": "2024-03-01T10:00:00Z",
            "message": "hello",
            "views": 10,
            "reactions": [{"emoji": "👍", "count": 3}, {"count": 1}],
            "media": [{"type": "photo", "url": "https://cdn/x.jpg"}],
            "fwd_from": {"from_name": "origin"},
            "edit_date": 1709290000,
            "pinned": true
        });
        let record = ApiAdapter::normalize(&channel(), &raw).unwrap();

        assert_eq!(record.channel_id, 777);
        assert_eq!(record.message_id, Some(101));
        assert_eq!(record.id_provenance, IdProvenance::Authoritative);
        assert_eq!(
            record.posted_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(record.views, Some(10));
        // Supported but omitted counters default to zero
        assert_eq!(record.forwards, Some(0));
        assert_eq!(record.reply_count, Some(0));
        assert_eq!(record.reactions.len(), 1);
        assert_eq!(record.media[0].kind, MediaKind::Photo);
        assert_eq!(record.forwarded_from.as_deref(), Some("origin"));
        assert!(record.edited_at.is_some());
        assert!(record.is_pinned);
    }

    #[test]
    fn test_normalize_rejects_items_without_id_or_date() {
        let missing_id = json!({"date": "2024-03-01T10:00:00Z"});
        let missing_date = json!({"id": 5});
        let mut ids = Vec::new();
        for raw in [missing_id, missing_date] {
            let err = ApiAdapter::normalize(&channel(), &raw).unwrap_err();
            assert_eq!(err.class(), crate::error::ErrorClass::Item);
            ids.push(err.item_id());
        }
        assert_eq!(ids, vec![None, Some(5)]);
    }

    #[test]
    fn test_channel_info() {
        let info = ApiAdapter::channel_info(
            "news",
            &json!({"id": 42, "title": "News", "participants_count": 1500}),
        );
        assert_eq!(info.id, Some(42));
        assert_eq!(info.name, "news");
        assert_eq!(info.title.as_deref(), Some("News"));
        assert_eq!(info.participants, Some(1500));
    }
}
