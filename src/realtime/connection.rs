//! Socket supervisor.
//!
//! A single task drives `Connecting → Open → Closing → Backoff →
//! Connecting` until the shutdown channel flips to `true`.  Status and the
//! live list are published on watch channels.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use super::live::LiveEvent;
use super::{Decoder, Reaction};
use crate::env::{env_or, env_parse};
use crate::upstream::{DmdataClient, SocketSession, SocketTicket, UpstreamError};

/// | Env var                       | Default        | Description                           |
/// |-------------------------------|----------------|---------------------------------------|
/// | `STREAM_RECONNECT_SECS`       | `5`            | delay after an ordinary close         |
/// | `STREAM_CLEANUP_MAX_ATTEMPTS` | `5`            | cleanup rounds before the fallback    |
/// | `STREAM_BACKOFF_BASE_SECS`    | `10`           | first connection-limit backoff        |
/// | `STREAM_BACKOFF_CAP_SECS`     | `300`          | backoff ceiling                       |
/// | `STREAM_FALLBACK_SECS`        | `900`          | delay when cleanup cannot help        |
/// | `STREAM_APP_NAME`             | `shindo-relay` | session name used for cleanup         |
/// | `LIVE_EVENT_CAP`              | `50`           | live list length                      |
/// | `STREAM_RECORD_PATH`          | unset          | append raw frames here (JSONL)        |
#[derive(Debug, Clone)]
pub struct StreamCfg {
    pub reconnect: Duration,
    pub cleanup_max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub fallback: Duration,
    pub app_name: String,
    pub live_cap: usize,
    pub record_path: Option<String>,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            reconnect: Duration::from_secs(5),
            cleanup_max_attempts: 5,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
            fallback: Duration::from_secs(900),
            app_name: "shindo-relay".into(),
            live_cap: 50,
            record_path: None,
        }
    }
}

impl StreamCfg {
    pub fn from_env() -> Self {
        Self {
            reconnect: Duration::from_secs(env_parse("STREAM_RECONNECT_SECS", 5)),
            cleanup_max_attempts: env_parse("STREAM_CLEANUP_MAX_ATTEMPTS", 5),
            backoff_base: Duration::from_secs(env_parse("STREAM_BACKOFF_BASE_SECS", 10)),
            backoff_cap: Duration::from_secs(env_parse("STREAM_BACKOFF_CAP_SECS", 300)),
            fallback: Duration::from_secs(env_parse("STREAM_FALLBACK_SECS", 900)),
            app_name: env_or("STREAM_APP_NAME", "shindo-relay"),
            live_cap: env_parse("LIVE_EVENT_CAP", 50),
            record_path: std::env::var("STREAM_RECORD_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty()),
        }
    }
}

impl fmt::Display for StreamCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamCfg(app={}, reconnect={}s, cleanup_attempts={}, backoff={}..{}s, fallback={}s, cap={}, record={})",
            self.app_name,
            self.reconnect.as_secs(),
            self.cleanup_max_attempts,
            self.backoff_base.as_secs(),
            self.backoff_cap.as_secs(),
            self.fallback.as_secs(),
            self.live_cap,
            self.record_path.as_deref().unwrap_or("off"),
        )
    }
}

// ───────────────────────────── Session admin ─────────────────────────────

/// Upstream session management used by the supervisor.
pub trait SocketAdmin {
    async fn open(&self, app_name: &str) -> Result<SocketTicket, UpstreamError>;
    async fn list_open(&self) -> Result<Vec<SocketSession>, UpstreamError>;
    async fn close(&self, id: i64) -> Result<(), UpstreamError>;
}

impl SocketAdmin for DmdataClient {
    async fn open(&self, app_name: &str) -> Result<SocketTicket, UpstreamError> {
        self.open_socket(app_name).await
    }

    async fn list_open(&self) -> Result<Vec<SocketSession>, UpstreamError> {
        self.list_open_sockets().await
    }

    async fn close(&self, id: i64) -> Result<(), UpstreamError> {
        self.close_socket(id).await
    }
}

/// Sessions we opened earlier, recognised by app name.  Sessions belonging
/// to other applications on the same contract are never ours to close.
pub fn stale_sessions(sessions: &[SocketSession], app_name: &str) -> Vec<i64> {
    sessions
        .iter()
        .filter(|s| s.app_name.as_deref() == Some(app_name))
        .map(|s| s.id)
        .collect()
}

async fn cleanup_stale<A: SocketAdmin>(admin: &A, app_name: &str) -> Result<usize, UpstreamError> {
    let sessions = admin.list_open().await?;
    let stale = stale_sessions(&sessions, app_name);
    if stale.is_empty() && !sessions.is_empty() {
        warn!(open = sessions.len(), "connection limit held by other applications; nothing to close");
    }
    for id in &stale {
        admin.close(*id).await?;
        info!(session = id, "closed stale socket session");
    }
    Ok(stale.len())
}

/// `base · 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

// ───────────────────────────── State machine ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Open,
    Closing,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    Ended,
    Failed(String),
    TooManyConnections(String),
    Shutdown,
}

/// Delay selection across closes; remembers consecutive limit refusals.
#[derive(Debug)]
pub struct ReconnectPolicy {
    cfg: StreamCfg,
    limit_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(cfg: StreamCfg) -> Self {
        Self {
            cfg,
            limit_attempts: 0,
        }
    }

    pub fn on_open(&mut self) {
        self.limit_attempts = 0;
    }

    /// How long to wait before the next attempt.  A connection-limit close
    /// triggers a bounded stale-session cleanup first.
    pub async fn after_close<A: SocketAdmin>(&mut self, reason: &CloseReason, admin: &A) -> Duration {
        let CloseReason::TooManyConnections(message) = reason else {
            return self.cfg.reconnect;
        };
        self.limit_attempts += 1;
        if self.limit_attempts > self.cfg.cleanup_max_attempts {
            warn!(attempts = self.limit_attempts, "connection limit persists; using fallback delay");
            return self.cfg.fallback;
        }
        warn!(attempt = self.limit_attempts, "connection limit: {message}");
        match cleanup_stale(admin, &self.cfg.app_name).await {
            Ok(closed) => {
                debug!(closed, "stale session cleanup done");
                backoff_delay(self.limit_attempts, self.cfg.backoff_base, self.cfg.backoff_cap)
            }
            Err(e) => {
                warn!("stale session cleanup failed: {e}");
                self.cfg.fallback
            }
        }
    }
}

enum State {
    Connecting,
    Open(SocketTicket),
    Closing(CloseReason),
    Backoff(Duration),
}

/// Receivers for whoever displays the live feed.
pub struct StreamHandles {
    pub status: watch::Receiver<Status>,
    pub events: watch::Receiver<Vec<LiveEvent>>,
}

pub struct Supervisor<A> {
    admin: A,
    cfg: StreamCfg,
    decoder: Decoder,
    status_tx: watch::Sender<Status>,
    events_tx: watch::Sender<Vec<LiveEvent>>,
}

impl<A: SocketAdmin> Supervisor<A> {
    pub fn new(admin: A, cfg: StreamCfg) -> (Self, StreamHandles) {
        let (status_tx, status) = watch::channel(Status::Connecting);
        let (events_tx, events) = watch::channel(Vec::new());
        let decoder = Decoder::new(cfg.live_cap);
        (
            Self {
                admin,
                cfg,
                decoder,
                status_tx,
                events_tx,
            },
            StreamHandles { status, events },
        )
    }

    fn set_status(&self, status: Status) {
        if *self.status_tx.borrow() != status {
            info!(?status, "stream status");
        }
        self.status_tx.send_replace(status);
    }

    /// Run until `shutdown` becomes `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut policy = ReconnectPolicy::new(self.cfg.clone());
        let mut state = State::Connecting;
        loop {
            if *shutdown.borrow() {
                break;
            }
            state = match state {
                State::Connecting => {
                    self.set_status(Status::Connecting);
                    match self.admin.open(&self.cfg.app_name).await {
                        Ok(ticket) => State::Open(ticket),
                        Err(UpstreamError::TooManyConnections(m)) => {
                            State::Closing(CloseReason::TooManyConnections(m))
                        }
                        Err(e) => State::Closing(CloseReason::Failed(e.to_string())),
                    }
                }
                State::Open(ticket) => match self.stream(&ticket, &mut policy, &mut shutdown).await {
                    Ok(reason) => State::Closing(reason),
                    Err(e) => State::Closing(CloseReason::Failed(format!("{e:#}"))),
                },
                State::Closing(CloseReason::Shutdown) => break,
                State::Closing(reason) => {
                    self.set_status(Status::Closing);
                    info!(?reason, "socket closed");
                    State::Backoff(policy.after_close(&reason, &self.admin).await)
                }
                State::Backoff(delay) => {
                    self.set_status(Status::Backoff);
                    info!("reconnecting in {}s", delay.as_secs());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    State::Connecting
                }
            };
        }
        self.set_status(Status::Stopped);
        info!("stream supervisor stopped");
    }

    async fn stream(
        &mut self,
        ticket: &SocketTicket,
        policy: &mut ReconnectPolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CloseReason> {
        let mut request = ticket
            .websocket
            .url
            .as_str()
            .into_client_request()
            .context("invalid socket url")?;
        if let Some(protocol) = ticket.websocket.protocol.first() {
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(protocol)?);
        }
        let (mut ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("websocket handshake failed")?;
        self.set_status(Status::Open);
        policy.on_open();

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => {
                    self.set_status(Status::Closing);
                    if let Err(e) = ws.close(None).await {
                        debug!("close on shutdown: {e}");
                    }
                    return Ok(CloseReason::Shutdown);
                }
                next = ws.next() => next,
            };
            let text = match next {
                None => return Ok(CloseReason::Ended),
                Some(Err(e)) => return Ok(CloseReason::Failed(e.to_string())),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed socket");
                    return Ok(CloseReason::Ended);
                }
                Some(Ok(_)) => continue,
            };
            self.record(&text);

            match self.decoder.handle(&text) {
                Reaction::Reply(reply) => ws.send(Message::Text(reply)).await?,
                Reaction::Applied { event_id, change } => {
                    debug!(event = %event_id, ?change, "live event");
                    self.events_tx.send_replace(self.decoder.live().events().to_vec());
                }
                Reaction::Upstream {
                    message,
                    close,
                    too_many,
                } => {
                    warn!(close, "upstream error frame: {message}");
                    if too_many {
                        return Ok(CloseReason::TooManyConnections(message));
                    }
                    if close {
                        return Ok(CloseReason::Failed(message));
                    }
                }
                Reaction::Started | Reaction::Ignored => {}
            }
        }
    }

    /// Append the raw frame to the recording file, if one is configured.
    fn record(&self, frame: &str) {
        let Some(path) = &self.cfg.record_path else {
            return;
        };
        let line = serde_json::json!({ "timestamp": Utc::now().timestamp_millis(), "frame": frame });
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!("could not record frame to {path}: {e}");
        }
    }
}

/// One line of a frame recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub timestamp: i64,
    pub frame: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::SocketEndpoint;
    use std::sync::Mutex;

    fn session(id: i64, app: Option<&str>) -> SocketSession {
        SocketSession {
            id,
            app_name: app.map(str::to_string),
        }
    }

    #[derive(Default)]
    struct FakeAdmin {
        sessions: Vec<SocketSession>,
        fail_list: bool,
        closed: Mutex<Vec<i64>>,
    }

    impl SocketAdmin for FakeAdmin {
        async fn open(&self, _app_name: &str) -> Result<SocketTicket, UpstreamError> {
            Ok(SocketTicket {
                websocket: SocketEndpoint {
                    id: None,
                    url: "ws://127.0.0.1:9/".into(),
                    protocol: vec![],
                },
            })
        }

        async fn list_open(&self) -> Result<Vec<SocketSession>, UpstreamError> {
            if self.fail_list {
                return Err(UpstreamError::Server {
                    status: 500,
                    body: "down".into(),
                });
            }
            Ok(self.sessions.clone())
        }

        async fn close(&self, id: i64) -> Result<(), UpstreamError> {
            self.closed.lock().unwrap().push(id);
            Ok(())
        }
    }

    fn limit() -> CloseReason {
        CloseReason::TooManyConnections("too many".into())
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(300);
        let delays: Vec<u64> = (1..=7).map(|n| backoff_delay(n, base, cap).as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn stale_sessions_are_only_our_own() {
        let sessions = vec![
            session(1, Some("dashboard")),
            session(2, Some("shindo-relay")),
            session(3, Some("shindo-relay")),
            session(4, None),
        ];
        assert_eq!(stale_sessions(&sessions, "shindo-relay"), vec![2, 3]);
        assert!(stale_sessions(&sessions, "other").is_empty());
        assert!(stale_sessions(&[], "x").is_empty());
    }

    #[tokio::test]
    async fn foreign_sessions_survive_limit_cleanup() {
        let admin = FakeAdmin {
            sessions: vec![session(9, Some("dashboard"))],
            ..FakeAdmin::default()
        };
        let mut policy = ReconnectPolicy::new(StreamCfg::default());
        assert_eq!(policy.after_close(&limit(), &admin).await, Duration::from_secs(10));
        assert!(admin.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_close_cleans_up_and_backs_off() {
        let admin = FakeAdmin {
            sessions: vec![session(5, Some("shindo-relay"))],
            ..FakeAdmin::default()
        };
        let mut policy = ReconnectPolicy::new(StreamCfg::default());
        assert_eq!(policy.after_close(&limit(), &admin).await, Duration::from_secs(10));
        assert_eq!(policy.after_close(&limit(), &admin).await, Duration::from_secs(20));
        assert_eq!(*admin.closed.lock().unwrap(), vec![5, 5]);

        policy.on_open();
        assert_eq!(policy.after_close(&limit(), &admin).await, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn ordinary_close_uses_fixed_delay() {
        let mut policy = ReconnectPolicy::new(StreamCfg::default());
        let d = policy.after_close(&CloseReason::Ended, &FakeAdmin::default()).await;
        assert_eq!(d, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn failed_cleanup_or_exhaustion_falls_back() {
        let broken = FakeAdmin {
            fail_list: true,
            ..FakeAdmin::default()
        };
        let cfg = StreamCfg {
            cleanup_max_attempts: 2,
            ..StreamCfg::default()
        };
        let mut policy = ReconnectPolicy::new(cfg.clone());
        assert_eq!(policy.after_close(&limit(), &broken).await, cfg.fallback);

        let fine = FakeAdmin::default();
        let mut policy = ReconnectPolicy::new(cfg.clone());
        policy.after_close(&limit(), &fine).await;
        policy.after_close(&limit(), &fine).await;
        assert_eq!(policy.after_close(&limit(), &fine).await, cfg.fallback);
    }

    #[tokio::test]
    async fn supervisor_stops_on_shutdown() {
        let (supervisor, handles) = Supervisor::new(FakeAdmin::default(), StreamCfg::default());
        let (tx, rx) = watch::channel(true);
        supervisor.run(rx).await;
        drop(tx);
        assert_eq!(*handles.status.borrow(), Status::Stopped);
    }
}
