//! Network transport behind the source adapters
//!
//! A [`Transport`] moves raw JSON between the upstream service and an
//! adapter. It knows nothing about message shapes; adapters normalize what
//! it returns.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::rotation::ProxyEndpoint;

/// Wait assumed when a 429 carries no usable `Retry-After`
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// One page request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Exclusive lower bound on message ids
    pub min_id: Option<i64>,
    /// Opaque continuation token from the previous page
    pub offset: Option<String>,
    pub limit: usize,
}

/// One page of raw items.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPage {
    #[serde(default, alias = "messages")]
    pub items: Vec<Value>,
    /// Continuation token; `None` when this is the last page
    #[serde(default)]
    pub next_offset: Option<String>,
}

/// Opaque network client used by every adapter variant.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session, through `endpoint` when given.
    async fn connect(&mut self, endpoint: Option<&ProxyEndpoint>) -> Result<()>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Endpoint of the current session, `None` for a direct connection
    fn endpoint(&self) -> Option<&ProxyEndpoint>;

    /// Raw channel metadata
    async fn channel_info(&self, channel: &str) -> Result<Value>;

    async fn fetch_page(&self, channel: &str, request: &PageRequest) -> Result<RawPage>;
}

/// JSON-over-HTTP transport.
///
/// Speaks `GET {base}/channels/{name}` and
/// `GET {base}/channels/{name}/messages?min_id=&offset=&limit=`.
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    client: Option<reqwest::Client>,
    endpoint: Option<ProxyEndpoint>,
}

impl HttpTransport {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("source.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            base_url,
            token: config.token.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            client: None,
            endpoint: None,
        })
    }

    fn build_client(&self, endpoint: Option<&ProxyEndpoint>) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| Error::Config(format!("invalid source.token: {}", e)))?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("chanwatch/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);
        if let Some(endpoint) = endpoint {
            let proxy = reqwest::Proxy::all(endpoint.url())
                .map_err(|e| Error::Config(format!("invalid proxy {}: {}", endpoint, e)))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.client.as_ref().ok_or(Error::NotConnected)
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)], channel: &str) -> Result<Value> {
        let response = self
            .client()?
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("failed to parse response: {}", e)));
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(status_error(status, channel, retry_after, &body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self, endpoint: Option<&ProxyEndpoint>) -> Result<()> {
        let client = self.build_client(endpoint)?;

        // Handshake: any HTTP answer means the path works.
        let url = format!("{}/health", self.base_url);
        client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("handshake with {} failed: {}", url, e)))?;

        self.client = Some(client);
        self.endpoint = endpoint.cloned();
        tracing::debug!(
            base_url = %self.base_url,
            endpoint = ?self.endpoint.as_ref().map(|e| e.to_string()),
            "Transport connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
        self.endpoint = None;
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.endpoint.as_ref()
    }

    async fn channel_info(&self, channel: &str) -> Result<Value> {
        let url = format!(
            "{}/channels/{}",
            self.base_url,
            urlencoding::encode(channel)
        );
        self.get_json(&url, &[], channel).await
    }

    async fn fetch_page(&self, channel: &str, request: &PageRequest) -> Result<RawPage> {
        let url = format!(
            "{}/channels/{}/messages",
            self.base_url,
            urlencoding::encode(channel)
        );

        let mut query = vec![("limit", request.limit.to_string())];
        if let Some(min_id) = request.min_id {
            query.push(("min_id", min_id.to_string()));
        }
        if let Some(offset) = &request.offset {
            query.push(("offset", offset.clone()));
        }

        let body = self.get_json(&url, &query, channel).await?;
        parse_page(body)
    }
}

/// Decode a page body; a bare array is a final page.
pub(crate) fn parse_page(body: Value) -> Result<RawPage> {
    match body {
        Value::Array(items) => Ok(RawPage {
            items,
            next_offset: None,
        }),
        other => serde_json::from_value(other)
            .map_err(|e| Error::Transport(format!("unexpected page shape: {}", e))),
    }
}

/// Map a non-success status onto the error taxonomy.
pub(crate) fn status_error(
    status: StatusCode,
    channel: &str,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            wait: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::UNAUTHORIZED => Error::Unauthorized(format!("upstream answered {}", status)),
        StatusCode::FORBIDDEN => Error::ChannelPrivate(channel.to_string()),
        StatusCode::NOT_FOUND => Error::ChannelInvalid(channel.to_string()),
        _ => Error::Transport(format!("API error ({}): {}", status, body)),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        let wait = Some(Duration::from_secs(42));
        match status_error(StatusCode::TOO_MANY_REQUESTS, "news", wait, "") {
            Error::RateLimited { wait } => assert_eq!(wait, Duration::from_secs(42)),
            other => panic!("unexpected {:?}", other),
        }
        match status_error(StatusCode::TOO_MANY_REQUESTS, "news", None, "") {
            Error::RateLimited { wait } => assert_eq!(wait, DEFAULT_RETRY_AFTER),
            other => panic!("unexpected {:?}", other),
        }

        let cases = [
            (StatusCode::UNAUTHORIZED, ErrorClass::SessionFatal),
            (StatusCode::FORBIDDEN, ErrorClass::SessionFatal),
            (StatusCode::NOT_FOUND, ErrorClass::SessionFatal),
            (StatusCode::BAD_GATEWAY, ErrorClass::Transient),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorClass::Transient),
        ];
        for (status, class) in cases {
            assert_eq!(status_error(status, "news", None, "").class(), class);
        }

        let private = status_error(StatusCode::FORBIDDEN, "news", None, "");
        assert!(private.is_channel_access());
        assert!(private.to_string().contains("news"));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 17 "));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(17)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_parse_page_shapes() {
        let page = parse_page(json!({
            "messages": [{"id": 1}, {"id": 2}],
            "next_offset": "abc"
        }))
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_offset.as_deref(), Some("abc"));

        let last = parse_page(json!([{"id": 3}])).unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_offset.is_none());

        assert!(parse_page(json!("nope")).is_err());
    }

    #[test]
    fn test_requires_base_url() {
        assert!(matches!(
            HttpTransport::new(&SourceConfig::default()),
            Err(Error::Config(_))
        ));

        let config = SourceConfig {
            base_url: Some("http://localhost:8080/".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url, "http://localhost:8080");
        assert!(!transport.is_connected());
        assert!(transport.endpoint().is_none());
    }
}
