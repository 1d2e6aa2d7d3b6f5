//! DMDATA.JP v2 REST client: telegram list/detail and socket session
//! management.
//!
//! | Env var             | Default                     | Description               |
//! |---------------------|-----------------------------|---------------------------|
//! | `DMDATA_BASE_URL`   | `https://api.dmdata.jp/v2`  | REST root                 |
//! | `LIST_TIMEOUT_MS`   | `30000`                     | list call timeout         |
//! | `DETAIL_TIMEOUT_MS` | `10000`                     | detail fetch timeout      |

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::env::{env_or, env_parse};
use crate::telegram::{RawTelegramItem, ReportKind};

pub const PROVIDER: &str = "dmdata";

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telegram {0} has neither an inline body nor a detail url")]
    NoBody(String),
    #[error("inline body of telegram {id} is unreadable: {reason}")]
    InlineBody { id: String, reason: String },
    #[error("too many open connections: {0}")]
    TooManyConnections(String),
}

/// A connection-limit refusal, recognised by status or by message.
pub fn is_connection_limit(status: Option<u16>, message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    status == Some(StatusCode::CONFLICT.as_u16())
        || msg.contains("too many")
        || (msg.contains("connection") && msg.contains("limit"))
        || msg.contains("上限")
}

/// Where telegrams come from.  The fetch cycle only depends on this seam.
pub trait TelegramSource {
    /// Newest-first items of one report kind.  Envelopes that do not parse
    /// are skipped with a warning.
    async fn list(&self, kind: ReportKind, limit: usize) -> Result<Vec<RawTelegramItem>, UpstreamError>;

    /// The report body of one item (XML or JSON text).
    async fn detail(&self, item: &RawTelegramItem) -> Result<String, UpstreamError>;
}

// ─────────────────────────── Wire types ──────────────────────────────────

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SocketStartRequest<'a> {
    classifications: &'a [&'a str],
    types: &'a [&'a str],
    test: &'a str,
    app_name: &'a str,
    format_mode: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketTicket {
    pub websocket: SocketEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketEndpoint {
    pub id: Option<i64>,
    pub url: String,
    #[serde(default)]
    pub protocol: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketSession {
    pub id: i64,
    pub app_name: Option<String>,
}

#[derive(Deserialize)]
struct SocketListResponse {
    #[serde(default)]
    items: Vec<SocketSession>,
}

// ─────────────────────────── Client ──────────────────────────────────────

#[derive(Clone)]
pub struct DmdataClient {
    http: Client,
    base_url: String,
    key: String,
    list_timeout: Duration,
    detail_timeout: Duration,
}

impl DmdataClient {
    pub fn new(base_url: &str, key: String, list_timeout: Duration, detail_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
            list_timeout,
            detail_timeout,
        }
    }

    /// Base URL and timeouts from the environment; the key is resolved by
    /// the caller (database first, then env).
    pub fn from_env(key: String) -> Self {
        Self::new(
            &env_or("DMDATA_BASE_URL", "https://api.dmdata.jp/v2"),
            key,
            Duration::from_millis(env_parse("LIST_TIMEOUT_MS", 30_000)),
            Duration::from_millis(env_parse("DETAIL_TIMEOUT_MS", 10_000)),
        )
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(UpstreamError::Server {
            status: status.as_u16(),
            body,
        })
    }

    /// Open a realtime socket session for earthquake telegrams.
    pub async fn open_socket(&self, app_name: &str) -> Result<SocketTicket, UpstreamError> {
        let request = SocketStartRequest {
            classifications: &["telegram.earthquake"],
            types: &["VXSE51", "VXSE52", "VXSE53"],
            test: "including",
            app_name,
            format_mode: "raw",
        };
        let resp = self
            .http
            .post(format!("{}/socket", self.base_url))
            .query(&[("key", self.key.as_str())])
            .timeout(self.list_timeout)
            .json(&request)
            .send()
            .await?;
        match Self::check(resp).await {
            Ok(resp) => Ok(resp.json().await?),
            Err(UpstreamError::Server { status, body }) if is_connection_limit(Some(status), &body) => {
                Err(UpstreamError::TooManyConnections(body))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_open_sockets(&self) -> Result<Vec<SocketSession>, UpstreamError> {
        let resp = self
            .http
            .get(format!("{}/socket", self.base_url))
            .query(&[("status", "open"), ("key", self.key.as_str())])
            .timeout(self.list_timeout)
            .send()
            .await?;
        let list: SocketListResponse = Self::check(resp).await?.json().await?;
        Ok(list.items)
    }

    pub async fn close_socket(&self, id: i64) -> Result<(), UpstreamError> {
        let resp = self
            .http
            .delete(format!("{}/socket/{id}", self.base_url))
            .query(&[("key", self.key.as_str())])
            .timeout(self.list_timeout)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

impl TelegramSource for DmdataClient {
    async fn list(&self, kind: ReportKind, limit: usize) -> Result<Vec<RawTelegramItem>, UpstreamError> {
        let limit = limit.to_string();
        let resp = self
            .http
            .get(format!("{}/telegram", self.base_url))
            .query(&[
                ("type", kind.code()),
                ("limit", limit.as_str()),
                ("key", self.key.as_str()),
            ])
            .timeout(self.list_timeout)
            .send()
            .await?;
        let list: ListResponse = Self::check(resp).await?.json().await?;

        let mut items = Vec::with_capacity(list.items.len());
        for raw in list.items {
            match RawTelegramItem::from_envelope(raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(kind = %kind, "skipping telegram envelope: {e:#}"),
            }
        }
        debug!(kind = %kind, count = items.len(), "listed telegrams");
        Ok(items)
    }

    async fn detail(&self, item: &RawTelegramItem) -> Result<String, UpstreamError> {
        if item.body.is_some() {
            return crate::realtime::decode_body(item).map_err(|e| UpstreamError::InlineBody {
                id: item.id.clone(),
                reason: format!("{e:#}"),
            });
        }
        let url = item
            .url
            .as_deref()
            .ok_or_else(|| UpstreamError::NoBody(item.id.clone()))?;
        let resp = self
            .http
            .get(url)
            .query(&[("key", self.key.as_str())])
            .timeout(self.detail_timeout)
            .send()
            .await?;
        Ok(Self::check(resp).await?.text().await?)
    }
}

impl fmt::Display for DmdataClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DmdataClient(base={}, list_timeout={}ms, detail_timeout={}ms)",
            self.base_url,
            self.list_timeout.as_millis(),
            self.detail_timeout.as_millis(),
        )
    }
}

/// In-memory [`TelegramSource`] for tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSource {
        pub quick: Vec<RawTelegramItem>,
        pub detailed: Vec<RawTelegramItem>,
        /// Detail bodies by telegram id; a missing id answers 404.
        pub bodies: HashMap<String, String>,
        pub fail_list: bool,
        pub detail_calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with_body(mut self, item: &RawTelegramItem, body: &str) -> Self {
            self.bodies.insert(item.id.clone(), body.to_string());
            self
        }

        pub fn detail_calls(&self) -> Vec<String> {
            self.detail_calls.lock().unwrap().clone()
        }
    }

    impl TelegramSource for FakeSource {
        async fn list(&self, kind: ReportKind, limit: usize) -> Result<Vec<RawTelegramItem>, UpstreamError> {
            if self.fail_list {
                return Err(UpstreamError::Server {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            let items = match kind {
                ReportKind::QuickIntensity => &self.quick,
                ReportKind::Detailed => &self.detailed,
                ReportKind::Hypocenter => return Ok(Vec::new()),
            };
            Ok(items.iter().take(limit).cloned().collect())
        }

        async fn detail(&self, item: &RawTelegramItem) -> Result<String, UpstreamError> {
            self.detail_calls.lock().unwrap().push(item.id.clone());
            self.bodies
                .get(&item.id)
                .cloned()
                .ok_or_else(|| UpstreamError::Server {
                    status: 404,
                    body: format!("no telegram {}", item.id),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_limit_signals() {
        assert!(is_connection_limit(Some(409), ""));
        assert!(is_connection_limit(None, "Too many connections"));
        assert!(is_connection_limit(None, "connection limit reached"));
        assert!(is_connection_limit(None, "同時接続数の上限に達しました"));
        assert!(!is_connection_limit(Some(500), "internal error"));
    }

    #[test]
    fn socket_ticket_shape() {
        let ticket: SocketTicket = serde_json::from_str(
            r#"{"ticket":"abc","websocket":{"id":7,"url":"wss://ws.example/?ticket=abc","protocol":["dmdata.v2"],"expiration":300}}"#,
        )
        .unwrap();
        assert_eq!(ticket.websocket.id, Some(7));
        assert_eq!(ticket.websocket.protocol, vec!["dmdata.v2"]);
    }

    #[tokio::test]
    async fn inline_body_is_used_without_a_url() {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD as BASE64;
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        // unroutable base: any request would fail
        let client = DmdataClient::new(
            "http://127.0.0.1:9/v2",
            "k".into(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all("<Report>震度速報</Report>".as_bytes()).unwrap();
        let mut it = crate::telegram::test_support::item("t1", "VXSE51", "2024-01-01T07:12:18Z", None);
        it.url = None;
        it.body = Some(BASE64.encode(gz.finish().unwrap()));
        it.encoding = Some("base64".into());
        it.compression = Some("gzip".into());
        assert_eq!(client.detail(&it).await.unwrap(), "<Report>震度速報</Report>");

        it.compression = Some("zstd".into());
        assert!(matches!(
            client.detail(&it).await,
            Err(UpstreamError::InlineBody { ref id, .. }) if id == "t1"
        ));

        it.body = None;
        assert!(matches!(client.detail(&it).await, Err(UpstreamError::NoBody(_))));
    }

    #[test]
    fn display_hides_key() {
        let c = DmdataClient::new(
            "https://api.example/v2/",
            "secret-key".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        let shown = c.to_string();
        assert!(!shown.contains("secret-key"));
        assert!(shown.contains("base=https://api.example/v2,"));
    }
}
