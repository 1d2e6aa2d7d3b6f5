use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crypto::SecretKey;
use crate::dispatch::chat::SlackClient;
use crate::dispatch::{self, DispatchCfg};
use crate::fetcher::{self, FetchCfg};
use crate::matcher::match_record;
use crate::store::prefectures::PrefectureMaster;
use crate::store::{SharedDb, heartbeat};
use crate::upstream::DmdataClient;

use super::shared::{PollCfg, ctrl_c, open_store};

pub(super) const HEARTBEAT_COMPONENT: &str = "poll";

/// One scheduled pass: fetch, persist, match, dispatch.  Returns a summary
/// for the heartbeat row.
async fn cycle(
    db: &SharedDb,
    secret: Option<&SecretKey>,
    fetch: &FetchCfg,
    dispatch_cfg: &DispatchCfg,
    chat: &SlackClient,
    purpose: &str,
) -> Result<String> {
    let master = PrefectureMaster::load(db)?;
    debug!(prefectures = master.len(), "prefecture master loaded");
    let key = fetcher::resolve_api_key(db, secret)?;
    let source = DmdataClient::from_env(key);

    let report = fetcher::run_cycle(db, &source, fetch, &master).await?;
    let mut queued = 0usize;
    for id in &report.created {
        match match_record(db, *id, purpose) {
            Ok(m) => queued += m.queued.len(),
            Err(e) => warn!(record = id, "matching failed: {e:#}"),
        }
    }
    let sent = dispatch::run_batch(db, chat, secret, dispatch_cfg).await?;
    Ok(format!("{report} queued={queued} {sent}"))
}

pub(super) async fn run() -> Result<()> {
    let db = open_store()?;
    let secret = SecretKey::from_env()?;
    let cfg = PollCfg::from_env();
    let fetch = FetchCfg::from_env().context("invalid fetch configuration")?;
    let dispatch_cfg = DispatchCfg::from_env();
    let chat = SlackClient::from_env();
    info!("Poll config: {cfg}");
    info!("Fetch config: {fetch}");
    info!("Dispatch config: {dispatch_cfg}");
    info!("Chat: {chat}");
    if secret.is_none() {
        warn!("ENCRYPTION_KEY is unset; stored credentials cannot be used");
    }

    let mut poll_tick = tokio::time::interval(cfg.interval);
    let mut sweep_tick = tokio::time::interval(cfg.dispatch_interval);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep_tick.tick().await;

    let stop = ctrl_c();
    tokio::pin!(stop);

    info!("Running. Polling every {}s...", cfg.interval.as_secs());
    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("Ctrl-C received; stopping");
                break;
            }
            _ = poll_tick.tick() => {
                let outcome = cycle(&db, secret.as_ref(), &fetch, &dispatch_cfg, &chat, &cfg.purpose).await;
                let (ok, detail) = match outcome {
                    Ok(summary) => {
                        info!("cycle done: {summary}");
                        (true, summary)
                    }
                    Err(e) => {
                        warn!("cycle aborted: {e:#}");
                        (false, format!("{e:#}"))
                    }
                };
                if let Err(e) = heartbeat::record(&db, HEARTBEAT_COMPONENT, Utc::now(), ok, &detail) {
                    warn!("could not write heartbeat: {e:#}");
                }
            }
            _ = sweep_tick.tick() => {
                if let Err(e) = dispatch::run_batch(&db, &chat, secret.as_ref(), &dispatch_cfg).await {
                    warn!("dispatch sweep failed: {e:#}");
                }
            }
        }
    }
    Ok(())
}
