//! Slack-compatible `chat.postMessage` client.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::env::{env_or, env_parse};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("chat request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat API returned {status}: {body}")]
    Server { status: u16, body: String },
    /// `ok: false`; carries the provider's error code verbatim.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub channel: String,
    /// Notification fallback text.
    pub text: String,
    pub blocks: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub ok: bool,
    pub ts: Option<String>,
    pub error: Option<String>,
}

impl ChatResponse {
    /// Message reference on success, the provider error otherwise.
    pub fn into_result(self) -> Result<String, ChatError> {
        if self.ok {
            Ok(self.ts.unwrap_or_default())
        } else {
            Err(ChatError::Rejected(
                self.error.unwrap_or_else(|| "unknown_error".into()),
            ))
        }
    }
}

pub trait ChatApi {
    /// Post one message with the workspace's bot token; returns the message
    /// reference (`ts`).
    async fn post_message(&self, token: &str, message: &ChatMessage) -> Result<String, ChatError>;
}

/// | Env var           | Default                                   |
/// |-------------------|-------------------------------------------|
/// | `CHAT_API_URL`    | `https://slack.com/api/chat.postMessage`  |
/// | `CHAT_TIMEOUT_MS` | `10000`                                   |
pub struct SlackClient {
    http: Client,
    url: String,
    timeout: Duration,
}

impl SlackClient {
    pub fn from_env() -> Self {
        Self {
            http: Client::new(),
            url: env_or("CHAT_API_URL", "https://slack.com/api/chat.postMessage"),
            timeout: Duration::from_millis(env_parse("CHAT_TIMEOUT_MS", 10_000)),
        }
    }
}

impl ChatApi for SlackClient {
    async fn post_message(&self, token: &str, message: &ChatMessage) -> Result<String, ChatError> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(message)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Server {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<ChatResponse>().await?.into_result()
    }
}

impl fmt::Display for SlackClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlackClient(url={}, timeout={}ms)",
            self.url,
            self.timeout.as_millis()
        )
    }
}
