//! Source adapters
//!
//! A [`SourceAdapter`] is one of a closed set of backends. Every variant
//! turns raw upstream items into [`MessageRecord`]s at this boundary and
//! exposes the same pull-based [`MessageStream`], so the fetch loop never
//! needs to know which backend it is driving. Behavior that differs per
//! backend is matched exhaustively here.

mod api;
mod mirror;
pub mod transport;
mod web;

pub use api::ApiAdapter;
pub use mirror::MirrorAdapter;
pub use transport::{HttpTransport, PageRequest, RawPage, Transport};
pub use web::{parse_compact_count, WebAdapter};

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::capabilities::Capabilities;
use crate::config::SourceConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::rotation::ProxyEndpoint;
use crate::types::{BackendKind, ChannelInfo, ChannelRef, MediaKind, MediaRef, MessageRecord};

/// Backend-specific adapter over an opaque [`Transport`].
pub enum SourceAdapter {
    Api(ApiAdapter),
    Web(WebAdapter),
    Mirror(MirrorAdapter),
}

/// Parameters for one paging session.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOptions {
    /// Stop after this many records
    pub limit: Option<usize>,
    /// Only return messages with a larger id; ignored by backends that
    /// cannot resume by id
    pub resume_after: Option<i64>,
    pub page_size: usize,
    /// Pause between page requests
    pub request_delay: Duration,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            limit: None,
            resume_after: None,
            page_size: 100,
            request_delay: Duration::ZERO,
        }
    }
}

impl ScrapeOptions {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            page_size: config.page_size,
            request_delay: Duration::from_millis(config.request_delay_ms),
            ..Default::default()
        }
    }
}

/// Where a paging session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub min_id: Option<i64>,
    /// Continuation token for the next page
    pub offset: Option<String>,
    pub pages_fetched: u64,
    pub exhausted: bool,
}

impl SourceAdapter {
    pub fn new(kind: BackendKind, transport: Box<dyn Transport>) -> Self {
        match kind {
            BackendKind::Api => SourceAdapter::Api(ApiAdapter::new(transport)),
            BackendKind::Web => SourceAdapter::Web(WebAdapter::new(transport)),
            BackendKind::Mirror => SourceAdapter::Mirror(MirrorAdapter::new(transport)),
        }
    }

    /// Adapter for the configured backend over HTTP
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(Self::new(
            config.backend,
            Box::new(HttpTransport::new(config)?),
        ))
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            SourceAdapter::Api(_) => BackendKind::Api,
            SourceAdapter::Web(_) => BackendKind::Web,
            SourceAdapter::Mirror(_) => BackendKind::Mirror,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_backend(self.kind())
    }

    fn transport(&self) -> &dyn Transport {
        match self {
            SourceAdapter::Api(a) => a.transport.as_ref(),
            SourceAdapter::Web(w) => w.transport.as_ref(),
            SourceAdapter::Mirror(m) => m.transport.as_ref(),
        }
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        match self {
            SourceAdapter::Api(a) => a.transport.as_mut(),
            SourceAdapter::Web(w) => w.transport.as_mut(),
            SourceAdapter::Mirror(m) => m.transport.as_mut(),
        }
    }

    /// Open a session, through `endpoint` when given.
    pub async fn connect(&mut self, endpoint: Option<&ProxyEndpoint>) -> Result<()> {
        let backend = self.kind();
        self.transport_mut().connect(endpoint).await?;
        tracing::info!(
            %backend,
            endpoint = %endpoint.map_or_else(|| "direct".to_string(), |e| e.to_string()),
            "Source connected"
        );
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport_mut().disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_connected()
    }

    /// Endpoint of the current session, `None` when direct
    pub fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.transport().endpoint()
    }

    /// Channel metadata, best effort.
    ///
    /// Returns `Ok(None)` when the backend has no metadata or the lookup
    /// failed for a reason that does not stop the session. Access errors
    /// are still returned.
    pub async fn get_channel_info(&self, channel: &str) -> Result<Option<ChannelInfo>> {
        let parse: fn(&str, &Value) -> ChannelInfo = match self {
            SourceAdapter::Api(_) => ApiAdapter::channel_info,
            SourceAdapter::Web(_) => WebAdapter::channel_info,
            SourceAdapter::Mirror(_) => return Ok(None),
        };
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        match self.transport().channel_info(channel).await {
            Ok(raw) => Ok(Some(parse(channel, &raw))),
            Err(e) if e.class() == ErrorClass::SessionFatal => Err(e),
            Err(e) => {
                tracing::warn!(channel, error = %e, "Channel info unavailable");
                Ok(None)
            }
        }
    }

    /// Resolve a channel name to a handle, using the platform id when the
    /// backend reports one.
    pub async fn resolve_channel(&self, name: &str) -> Result<(ChannelRef, Option<ChannelInfo>)> {
        let fallback = ChannelRef::from_name(name);
        let info = self.get_channel_info(&fallback.name).await?;
        let channel = match info.as_ref().and_then(|i| i.id) {
            Some(id) if self.capabilities().message_id_reliable => ChannelRef::new(id, fallback.name),
            _ => fallback,
        };
        Ok((channel, info))
    }

    /// Start a paging session over `channel`.
    ///
    /// Each call starts over; resuming mid-session goes through the
    /// stream's own cursor.
    pub fn scrape(&mut self, channel: ChannelRef, options: ScrapeOptions) -> MessageStream<'_> {
        let min_id = match options.resume_after {
            Some(id) if self.capabilities().resume_by_id => Some(id),
            Some(id) => {
                tracing::debug!(
                    channel = %channel.name,
                    backend = %self.kind(),
                    checkpoint = id,
                    "Backend cannot resume by id, starting from the beginning"
                );
                None
            }
            None => None,
        };

        match self {
            SourceAdapter::Web(web) => web.reset_session(),
            SourceAdapter::Api(_) | SourceAdapter::Mirror(_) => {}
        }

        MessageStream {
            adapter: self,
            channel,
            cursor: PageCursor {
                min_id,
                ..Default::default()
            },
            buffer: VecDeque::new(),
            limit: options.limit,
            page_size: options.page_size.max(1),
            request_delay: options.request_delay,
            emitted: 0,
        }
    }

    async fn fetch_page(&self, channel: &str, request: &PageRequest) -> Result<RawPage> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transport().fetch_page(channel, request).await
    }

    fn normalize(&mut self, channel: &ChannelRef, raw: &Value) -> Result<Option<MessageRecord>> {
        match self {
            SourceAdapter::Api(_) => ApiAdapter::normalize(channel, raw).map(Some),
            SourceAdapter::Web(web) => web.normalize(channel, raw),
            SourceAdapter::Mirror(_) => MirrorAdapter::normalize(channel, raw).map(Some),
        }
    }
}

/// Lazy sequence of records from one paging session.
///
/// A failed page fetch leaves the cursor where it was, so the next call to
/// [`MessageStream::next_message`] retries the same page.
pub struct MessageStream<'a> {
    adapter: &'a mut SourceAdapter,
    channel: ChannelRef,
    cursor: PageCursor,
    buffer: VecDeque<Value>,
    limit: Option<usize>,
    page_size: usize,
    request_delay: Duration,
    emitted: usize,
}

impl MessageStream<'_> {
    /// Next record, or `None` when the source is exhausted or the limit
    /// was reached.
    pub async fn next_message(&mut self) -> Option<Result<MessageRecord>> {
        loop {
            if self.limit.is_some_and(|limit| self.emitted >= limit) {
                return None;
            }

            if let Some(raw) = self.buffer.pop_front() {
                match self.adapter.normalize(&self.channel, &raw) {
                    Ok(Some(record)) => {
                        self.emitted += 1;
                        return Some(Ok(record));
                    }
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if self.cursor.exhausted {
                return None;
            }
            if let Err(e) = self.fill().await {
                return Some(Err(e));
            }
        }
    }

    async fn fill(&mut self) -> Result<()> {
        if self.cursor.pages_fetched > 0 && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let request = PageRequest {
            min_id: self.cursor.min_id,
            offset: self.cursor.offset.clone(),
            limit: self.page_size,
        };
        let page = self.adapter.fetch_page(&self.channel.name, &request).await?;

        self.cursor.pages_fetched += 1;
        self.cursor.exhausted = page.items.is_empty() || page.next_offset.is_none();
        self.cursor.offset = page.next_offset;
        tracing::debug!(
            channel = %self.channel.name,
            items = page.items.len(),
            page = self.cursor.pages_fetched,
            last = self.cursor.exhausted,
            "Fetched page"
        );
        self.buffer.extend(page.items);
        Ok(())
    }

    /// Replace the session's connection path without losing the cursor.
    pub async fn reconnect(&mut self, endpoint: Option<&ProxyEndpoint>) -> Result<()> {
        self.adapter.disconnect().await;
        self.adapter.connect(endpoint).await
    }

    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn adapter(&self) -> &SourceAdapter {
        self.adapter
    }

    /// Records returned so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

// Raw field helpers shared by the adapters.

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

fn u64_field(raw: &Value, key: &str) -> Option<u64> {
    match raw.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339 or RFC 2822 strings, or unix seconds.
fn timestamp_field(raw: &Value, key: &str) -> Option<DateTime<Utc>> {
    match raw.get(key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_rfc2822(s))
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        _ => None,
    }
}

fn media_refs(value: Option<&Value>) -> Vec<MediaRef> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| {
            let mime_type = str_field(item, "mime_type").map(String::from);
            let kind = str_field(item, "type")
                .or(mime_type.as_deref())
                .map(MediaKind::from_label)
                .unwrap_or(MediaKind::Other);
            MediaRef {
                kind,
                url: str_field(item, "url").map(String::from),
                mime_type,
            }
        })
        .collect()
}
