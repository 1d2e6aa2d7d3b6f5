//! One-shot operator modes.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::crypto::{self, SecretKey};
use crate::dispatch::chat::SlackClient;
use crate::dispatch::{self, DispatchCfg};
use crate::env::{must_env, parse_list};
use crate::store::{heartbeat, notifications};

use super::poll::HEARTBEAT_COMPONENT;
use super::shared::open_store;

pub(super) async fn dispatch_once() -> Result<()> {
    let db = open_store()?;
    let secret = SecretKey::from_env()?;
    let cfg = DispatchCfg::from_env();
    let chat = SlackClient::from_env();
    info!("Dispatch config: {cfg}");
    let report = dispatch::run_batch(&db, &chat, secret.as_ref(), &cfg).await?;
    println!("{report}");
    Ok(())
}

fn parse_ids(raw: &str) -> Result<Vec<i64>> {
    parse_list(raw)
        .iter()
        .map(|s| s.parse().with_context(|| format!("REQUEUE_IDS: {s:?} is not an id")))
        .collect()
}

pub(super) fn requeue() -> Result<()> {
    let db = open_store()?;
    let ids = match std::env::var("REQUEUE_IDS") {
        Ok(raw) if !raw.trim().is_empty() => Some(parse_ids(&raw)?),
        _ => None,
    };
    let n = notifications::requeue_failed(&db, ids.as_deref())?;
    info!("re-queued {n} failed notifications");
    println!("requeued={n}");
    Ok(())
}

pub(super) fn health() -> Result<()> {
    let db = open_store()?;
    let beat = heartbeat::last(&db, HEARTBEAT_COMPONENT)?;
    let health = heartbeat::classify(beat.as_ref().map(|b| b.last_run_at), Utc::now());
    match beat {
        Some(b) => println!(
            "{health} (last run {}, ok={}, {})",
            b.last_run_at.to_rfc3339(),
            b.ok,
            b.detail.unwrap_or_default()
        ),
        None => println!("{health} (never run)"),
    }
    Ok(())
}

pub(super) fn seal() -> Result<()> {
    let secret = SecretKey::from_env()?.ok_or_else(|| anyhow!("ENCRYPTION_KEY is required to seal"))?;
    let plaintext = must_env("SEAL_PLAINTEXT")?;
    let sealed = crypto::encrypt(&secret, &plaintext)?;
    println!("ciphertext={}", sealed.ciphertext);
    println!("iv={}", sealed.iv);
    println!("auth_tag={}", sealed.auth_tag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_ids_parse() {
        assert_eq!(parse_ids("3, 7,,9").unwrap(), vec![3, 7, 9]);
        assert!(parse_ids("3,x").is_err());
    }
}
