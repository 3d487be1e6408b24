//! Lowest-fidelity adapter over a feed mirror of the channel.
//!
//! Feed entries look like
//! `{"link": "https://mirror/news/123", "published": "Fri, 01 Mar 2024 10:00:00 +0000",
//! "description": "...", "enclosures": [{"url": "...", "type": "image/jpeg"}]}`.

use chrono::Utc;
use serde_json::Value;

use super::transport::Transport;
use super::{str_field, timestamp_field};
use crate::error::{Error, Result};
use crate::types::{BackendKind, ChannelRef, IdProvenance, MediaKind, MediaRef, MessageRecord};

pub struct MirrorAdapter {
    pub(super) transport: Box<dyn Transport>,
}

impl MirrorAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub(super) fn normalize(channel: &ChannelRef, raw: &Value) -> Result<MessageRecord> {
        let link = str_field(raw, "link");
        let posted_at = timestamp_field(raw, "published")
            .or_else(|| timestamp_field(raw, "pubDate"))
            .ok_or_else(|| {
                Error::normalize("mirror", format!("entry {:?} has no publish date", link))
            })?;

        let message_id = link.and_then(trailing_number);
        let text = str_field(raw, "description")
            .or_else(|| str_field(raw, "title"))
            .unwrap_or_default()
            .to_string();

        let media = raw
            .get("enclosures")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let url = str_field(item, "url")?;
                        let mime = str_field(item, "type");
                        Some(MediaRef {
                            kind: mime.map(MediaKind::from_label).unwrap_or(MediaKind::Other),
                            url: Some(url.to_string()),
                            mime_type: mime.map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(MessageRecord {
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
            views: None,
            forwards: None,
            reply_count: None,
            reactions: Vec::new(),
            media,
            forwarded_from: None,
            edited_at: None,
            is_pinned: false,
            backend: BackendKind::Mirror,
            collected_at: Utc::now(),
        })
    }
}

/// Trailing numeric path segment of a link, ignoring query and fragment.
fn trailing_number(link: &str) -> Option<i64> {
    let path = link.split(['?', '#']).next()?;
    path.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}
