//! Dispatch worker: drains pending notifications into chat messages.
//!
//! Every notification is settled on its own: a missing credential, a bad
//! payload or a chat rejection marks that row `failed` and the batch moves
//! on.  Nothing here retries; `failed` rows wait for an explicit re-queue.

pub mod chat;
pub mod template;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use futures_util::future::join_all;
use std::fmt;
use tracing::{debug, info, warn};

use crate::crypto::{self, SecretKey};
use crate::env::env_parse;
use crate::store::notifications::{self, Notification};
use crate::store::{SharedDb, records, workspaces};
use crate::telegram::SourceBundle;
use chat::{ChatApi, ChatError, ChatMessage};

/// | Env var                   | Default | Description                          |
/// |---------------------------|---------|--------------------------------------|
/// | `DISPATCH_BATCH_SIZE`     | `10`    | notifications per pass               |
/// | `DISPATCH_CLAIM_TTL_SECS` | `300`   | age after which a claim may be taken |
#[derive(Debug, Clone)]
pub struct DispatchCfg {
    pub batch_size: usize,
    pub claim_ttl: Duration,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self {
            batch_size: 10,
            claim_ttl: Duration::seconds(300),
        }
    }
}

impl DispatchCfg {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_parse("DISPATCH_BATCH_SIZE", 10usize).max(1),
            claim_ttl: Duration::seconds(env_parse("DISPATCH_CLAIM_TTL_SECS", 300i64).max(1)),
        }
    }
}

impl fmt::Display for DispatchCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DispatchCfg(batch_size={}, claim_ttl={}s)",
            self.batch_size,
            self.claim_ttl.num_seconds()
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sent={} failed={}", self.sent, self.failed)
    }
}

enum Outcome {
    Delivered(String),
    Failed(String),
}

/// Build the message for one notification, or the reason it cannot be sent.
fn prepare(
    db: &SharedDb,
    secret: Option<&SecretKey>,
    n: &Notification,
) -> Result<(String, ChatMessage), String> {
    let workspace = workspaces::workspace(db, n.workspace_id)
        .map_err(|e| format!("{e:#}"))?
        .ok_or_else(|| format!("workspace {} not found", n.workspace_id))?;
    let sealed = workspace
        .bot_token
        .ok_or_else(|| format!("bot token is not configured for workspace {}", workspace.name))?;
    let secret = secret.ok_or_else(|| "ENCRYPTION_KEY is not configured".to_string())?;
    let token = crypto::decrypt(secret, &sealed)
        .map_err(|e| format!("bot token could not be decrypted: {e}"))?;

    let message = compose(db, n).map_err(|e| format!("{e:#}"))?;
    Ok((token, message))
}

fn compose(db: &SharedDb, n: &Notification) -> Result<ChatMessage> {
    let departments = workspaces::active_departments(db, n.workspace_id)?;
    let tpl = workspaces::active_template(db, n.workspace_id)?.unwrap_or_else(template::default_template);

    let record = records::load(db, n.record_id)?
        .ok_or_else(|| anyhow!("record {} not found", n.record_id))?;
    let info = SourceBundle::from_payload(&record.raw_payload)?
        .extract()
        .with_context(|| format!("record {} payload yields no earthquake", n.record_id))?;

    let values = template::Values::from_info(&info);
    let title = template::render(&tpl.title, &values);
    let body = template::render(&tpl.body, &values);
    Ok(ChatMessage {
        channel: n.channel_id.clone(),
        text: format!("{title}\n{body}"),
        blocks: template::blocks(&title, &body, &departments, n.id),
    })
}

async fn dispatch_one<C: ChatApi>(db: &SharedDb, chat: &C, secret: Option<&SecretKey>, n: &Notification) -> Outcome {
    let (token, message) = match prepare(db, secret, n) {
        Ok(ready) => ready,
        Err(reason) => return Outcome::Failed(reason),
    };
    match chat.post_message(&token, &message).await {
        Ok(ts) => Outcome::Delivered(ts),
        Err(ChatError::Rejected(code)) => Outcome::Failed(code),
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

/// Claim the rows this pass will deliver.  Rows another pass holds are
/// skipped.
fn claim_batch(db: &SharedDb, batch: Vec<Notification>, cfg: &DispatchCfg) -> Vec<Notification> {
    let now = Utc::now();
    let stale_before = now - cfg.claim_ttl;
    batch
        .into_iter()
        .filter(|n| match notifications::claim(db, n.id, now, stale_before) {
            Ok(true) => true,
            Ok(false) => {
                debug!(notification = n.id, "claimed by another pass; skipped");
                false
            }
            Err(e) => {
                warn!(notification = n.id, "could not claim notification: {e:#}");
                false
            }
        })
        .collect()
}

/// One pass over the oldest pending notifications.
pub async fn run_batch<C: ChatApi>(
    db: &SharedDb,
    chat: &C,
    secret: Option<&SecretKey>,
    cfg: &DispatchCfg,
) -> Result<DispatchReport> {
    let pending = notifications::pending_batch(db, cfg.batch_size, Utc::now() - cfg.claim_ttl)?;
    let batch = claim_batch(db, pending, cfg);
    if batch.is_empty() {
        return Ok(DispatchReport::default());
    }

    let outcomes = join_all(batch.iter().map(|n| dispatch_one(db, chat, secret, n))).await;

    let mut report = DispatchReport::default();
    for (n, outcome) in batch.iter().zip(outcomes) {
        let settled = match &outcome {
            Outcome::Delivered(ts) => notifications::mark_sent(db, n.id, ts, Utc::now()),
            Outcome::Failed(reason) => notifications::mark_failed(db, n.id, reason),
        };
        match (outcome, settled) {
            (_, Err(e)) => warn!(notification = n.id, "could not record dispatch result: {e:#}"),
            (_, Ok(false)) => debug!(notification = n.id, "already settled elsewhere"),
            (Outcome::Delivered(_), Ok(true)) => report.sent += 1,
            (Outcome::Failed(reason), Ok(true)) => {
                warn!(notification = n.id, channel = %n.channel_id, "notification failed: {reason}");
                report.failed += 1;
            }
        }
    }

    info!("dispatch pass: {report}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::chat::fake::FakeChat;
    use super::*;
    use crate::crypto::{encrypt, test_key};
    use crate::matcher::match_record;
    use crate::store::notifications::Status;
    use crate::store::open_memory;
    use crate::store::prefectures::PrefectureMaster;
    use crate::store::records::DedupScope;
    use crate::store::workspaces::fixtures;
    use crate::telegram::test_support::*;

    /// One record matched to `channels` of workspace 1.
    fn queued(db: &SharedDb, token: Option<&crypto::SealedSecret>, channels: &[&str]) -> i64 {
        fixtures::workspace(db, 1, token);
        for c in channels {
            fixtures::channel(db, 1, c, "earthquake");
        }
        fixtures::condition(db, 1, "3", None, &[]);
        fixtures::department(db, 1, 7, "総務", 1);
        let bundle = SourceBundle {
            quick: report(
                item("q1", "VXSE51", "2024-01-01T07:10:48Z", Some("20240101161010")),
                QUICK_XML,
            ),
            detailed: Some(report(
                item("d1", "VXSE53", "2024-01-01T07:12:18Z", Some("20240101161010")),
                DETAILED_XML,
            )),
        };
        let info = bundle.extract().unwrap();
        let master = PrefectureMaster::load(db).unwrap();
        let id = records::persist(db, &bundle, &info, &master, DedupScope::Event)
            .unwrap()
            .created_id()
            .unwrap();
        match_record(db, id, "earthquake").unwrap();
        id
    }

    #[tokio::test]
    async fn rejection_fails_only_that_notification() {
        let db = open_memory();
        let key = test_key(1);
        let sealed = encrypt(&key, "xoxb-live").unwrap();
        let record = queued(&db, Some(&sealed), &["C-gone", "C-ok"]);
        let chat = FakeChat::rejecting("C-gone", "channel_not_found");

        let report = run_batch(&db, &chat, Some(&key), &DispatchCfg::default()).await.unwrap();
        assert_eq!(report, DispatchReport { sent: 1, failed: 1 });

        let rows = notifications::for_record(&db, record).unwrap();
        let gone = rows.iter().find(|n| n.channel_id == "C-gone").unwrap();
        assert_eq!(gone.status, Status::Failed);
        assert_eq!(gone.error_message.as_deref(), Some("channel_not_found"));
        let ok = rows.iter().find(|n| n.channel_id == "C-ok").unwrap();
        assert_eq!(ok.status, Status::Sent);
        assert!(ok.message_ref.is_some());

        let sent = chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "xoxb-live");
        assert!(sent[0].1.text.contains("石川県能登地方"));
        assert_eq!(sent[0].1.blocks[2]["elements"][0]["action_id"], "department_7");
    }

    #[tokio::test]
    async fn undecryptable_token_fails_without_calling_chat() {
        let db = open_memory();
        let sealed = encrypt(&test_key(1), "xoxb-live").unwrap();
        let record = queued(&db, Some(&sealed), &["C-ok"]);
        let chat = FakeChat::default();

        let report = run_batch(&db, &chat, Some(&test_key(2)), &DispatchCfg::default()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(chat.sent().is_empty());
        let row = &notifications::for_record(&db, record).unwrap()[0];
        assert!(row.error_message.as_deref().unwrap().contains("decrypted"));
    }

    #[tokio::test]
    async fn missing_token_fails() {
        let db = open_memory();
        let record = queued(&db, None, &["C-ok"]);
        let report = run_batch(&db, &FakeChat::default(), Some(&test_key(1)), &DispatchCfg::default())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        let row = &notifications::for_record(&db, record).unwrap()[0];
        assert_eq!(row.status, Status::Failed);
        assert_eq!(
            row.error_message.as_deref(),
            Some("bot token is not configured for workspace ws1")
        );
    }

    #[tokio::test]
    async fn batch_size_bounds_a_pass() {
        let db = open_memory();
        let key = test_key(1);
        let sealed = encrypt(&key, "xoxb").unwrap();
        queued(&db, Some(&sealed), &["C1", "C2", "C3"]);
        let chat = FakeChat::default();
        let cfg = DispatchCfg {
            batch_size: 2,
            ..DispatchCfg::default()
        };

        assert_eq!(run_batch(&db, &chat, Some(&key), &cfg).await.unwrap().sent, 2);
        assert_eq!(run_batch(&db, &chat, Some(&key), &cfg).await.unwrap().sent, 1);
        assert_eq!(run_batch(&db, &chat, Some(&key), &cfg).await.unwrap(), DispatchReport::default());
    }

    #[tokio::test]
    async fn overlapping_passes_post_once() {
        let db = open_memory();
        let key = test_key(1);
        let sealed = encrypt(&key, "xoxb").unwrap();
        let record = queued(&db, Some(&sealed), &["C1"]);
        let chat = FakeChat::default();
        let cfg = DispatchCfg::default();

        let (a, b) = tokio::join!(
            run_batch(&db, &chat, Some(&key), &cfg),
            run_batch(&db, &chat, Some(&key), &cfg),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.sent + b.sent, 1);
        assert_eq!(chat.sent().len(), 1);
        assert_eq!(notifications::for_record(&db, record).unwrap()[0].status, Status::Sent);
    }

    #[tokio::test]
    async fn server_error_fails_row_and_batch_continues() {
        let db = open_memory();
        let key = test_key(1);
        let sealed = encrypt(&key, "xoxb").unwrap();
        let record = queued(&db, Some(&sealed), &["C-down", "C-ok"]);
        let chat = FakeChat::transport_failing("C-down", 503, "upstream unavailable");

        let report = run_batch(&db, &chat, Some(&key), &DispatchCfg::default()).await.unwrap();
        assert_eq!(report, DispatchReport { sent: 1, failed: 1 });

        let rows = notifications::for_record(&db, record).unwrap();
        let down = rows.iter().find(|n| n.channel_id == "C-down").unwrap();
        assert_eq!(down.status, Status::Failed);
        assert_eq!(
            down.error_message.as_deref(),
            Some("chat API returned 503: upstream unavailable")
        );
        assert_eq!(rows.iter().find(|n| n.channel_id == "C-ok").unwrap().status, Status::Sent);
    }

    #[tokio::test]
    async fn active_template_replaces_default() {
        let db = open_memory();
        let key = test_key(1);
        let sealed = encrypt(&key, "xoxb").unwrap();
        fixtures::template(&db, 1, "[訓練] {{epicenter}}", "最大震度 {{maxIntensity}} / {{magnitude}}");
        queued(&db, Some(&sealed), &["C1"]);
        let chat = FakeChat::default();

        run_batch(&db, &chat, Some(&key), &DispatchCfg::default()).await.unwrap();
        let sent = chat.sent();
        let message = &sent[0].1;
        assert_eq!(message.text, "[訓練] 石川県能登地方\n最大震度 7 / M7.4");
        assert_eq!(message.blocks[0]["text"]["text"], "[訓練] 石川県能登地方");
        assert!(!message.text.contains("各部署"));
    }
}
