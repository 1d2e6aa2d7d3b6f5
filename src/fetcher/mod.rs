//! Poll-and-pair fetch cycle.
//!
//! One cycle lists both report kinds, pulls quick-intensity details, drops
//! sub-threshold events, pairs each survivor with the closest detailed
//! report inside the window, and hands the merged record to the store.

pub mod fetcher_tests;

use anyhow::{Result, bail};
use chrono::Duration;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::crypto::{self, SecretKey};
use crate::env::{env_or, env_parse};
use crate::intensity;
use crate::store::SharedDb;
use crate::store::prefectures::PrefectureMaster;
use crate::store::records::{self, DedupScope, PersistOutcome};
use crate::store::workspaces;
use crate::telegram::{RawTelegramItem, ReportKind, SourceBundle, SourceReport, parse_report_body};
use crate::upstream::{PROVIDER, TelegramSource};

/// Fetch-cycle tuning.
///
/// | Env var               | Default | Description                               |
/// |-----------------------|---------|-------------------------------------------|
/// | `FETCH_LIMIT`         | `10`    | items per list call                       |
/// | `PAIRING_WINDOW_SECS` | `300`   | max issue-time gap for pairing            |
/// | `MIN_INTENSITY`       | `3`     | discard floor (number or label)           |
/// | `RECORD_DEDUP_SCOPE`  | `event` | `event` or `event_serial`                 |
#[derive(Debug, Clone)]
pub struct FetchCfg {
    pub limit: usize,
    pub pairing_window: Duration,
    pub min_intensity: f64,
    pub dedup_scope: DedupScope,
}

impl Default for FetchCfg {
    fn default() -> Self {
        Self {
            limit: 10,
            pairing_window: Duration::seconds(300),
            min_intensity: 3.0,
            dedup_scope: DedupScope::Event,
        }
    }
}

impl FetchCfg {
    pub fn from_env() -> Result<Self> {
        let raw_floor = env_or("MIN_INTENSITY", "3");
        let Some(min_intensity) = intensity::parse_floor(&raw_floor) else {
            bail!("MIN_INTENSITY {raw_floor:?} is not an intensity");
        };
        Ok(Self {
            limit: env_parse("FETCH_LIMIT", 10),
            pairing_window: Duration::seconds(env_parse("PAIRING_WINDOW_SECS", 300)),
            min_intensity,
            dedup_scope: env_or("RECORD_DEDUP_SCOPE", "event").parse()?,
        })
    }
}

impl fmt::Display for FetchCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FetchCfg(limit={}, window={}s, min_intensity={}, dedup={})",
            self.limit,
            self.pairing_window.num_seconds(),
            self.min_intensity,
            self.dedup_scope,
        )
    }
}

/// The upstream key: an encrypted database credential wins, the
/// `DMDATA_API_KEY` env var is the fallback.  No key fails the cycle.
pub fn resolve_api_key(db: &SharedDb, secret: Option<&SecretKey>) -> Result<String> {
    let env_key = std::env::var("DMDATA_API_KEY").ok();
    choose_api_key(db, secret, env_key.as_deref())
}

fn choose_api_key(db: &SharedDb, secret: Option<&SecretKey>, env_key: Option<&str>) -> Result<String> {
    match (workspaces::active_api_credential(db, PROVIDER)?, secret) {
        (Some(sealed), Some(secret)) => match crypto::decrypt(secret, &sealed) {
            Ok(key) => return Ok(key),
            Err(e) => warn!("stored API key unusable, trying env: {e}"),
        },
        (Some(_), None) => warn!("stored API key present but ENCRYPTION_KEY is unset"),
        (None, _) => {}
    }
    match env_key.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => bail!("no upstream API key (database credential or DMDATA_API_KEY)"),
    }
}

/// The detailed report closest in issue time to `quick`, within `window`.
/// Candidates carrying a different known event id are never chosen; ties
/// go to the earlier candidate in list order.
pub fn find_partner<'a>(
    quick: &RawTelegramItem,
    candidates: &'a [RawTelegramItem],
    window: Duration,
) -> Option<&'a RawTelegramItem> {
    candidates
        .iter()
        .filter(|c| match (&quick.head.event_id, &c.head.event_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        })
        .map(|c| (c, (c.issued_at - quick.issued_at).abs()))
        .filter(|(_, gap)| *gap <= window)
        .min_by_key(|(_, gap)| *gap)
        .map(|(c, _)| c)
}

#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub listed_quick: usize,
    pub listed_detailed: usize,
    pub below_threshold: usize,
    pub paired: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub failed: usize,
    /// Records created this cycle, in processing order.
    pub created: Vec<i64>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "quick={} detailed={} below_threshold={} paired={} created={} duplicates={} stale={} failed={}",
            self.listed_quick,
            self.listed_detailed,
            self.below_threshold,
            self.paired,
            self.created.len(),
            self.duplicates,
            self.stale,
            self.failed,
        )
    }
}

async fn fetch_report<S: TelegramSource>(source: &S, item: &RawTelegramItem) -> Result<SourceReport> {
    let body = source.detail(item).await?;
    let tree = parse_report_body(&body)?;
    Ok(SourceReport {
        item: item.clone(),
        tree,
    })
}

/// One fetch cycle.  A failed list call fails the cycle; everything after
/// that fails per item.
pub async fn run_cycle<S: TelegramSource>(
    db: &SharedDb,
    source: &S,
    cfg: &FetchCfg,
    master: &PrefectureMaster,
) -> Result<CycleReport> {
    let (quick_items, detailed_items) = tokio::try_join!(
        source.list(ReportKind::QuickIntensity, cfg.limit),
        source.list(ReportKind::Detailed, cfg.limit),
    )?;
    let mut report = CycleReport {
        listed_quick: quick_items.len(),
        listed_detailed: detailed_items.len(),
        ..CycleReport::default()
    };

    // Quick-intensity details, then the threshold gate.
    let fetched = join_all(quick_items.iter().map(|item| fetch_report(source, item))).await;
    let mut actionable = Vec::new();
    for (item, result) in quick_items.iter().zip(fetched) {
        let quick = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(telegram = %item.id, "detail fetch failed: {e:#}");
                report.failed += 1;
                continue;
            }
        };
        let Some(info) = quick.extract() else {
            report.failed += 1;
            continue;
        };
        let max = info.max_intensity.as_deref().unwrap_or("");
        if !intensity::meets(max, cfg.min_intensity) {
            debug!(event = %info.event_id, intensity = max, "below threshold; discarded");
            report.below_threshold += 1;
            continue;
        }
        let partner = find_partner(item, &detailed_items, cfg.pairing_window);
        actionable.push((quick, partner));
    }

    // Each partner is fetched once even if several quick items chose it.
    let mut partner_ids: Vec<&RawTelegramItem> = Vec::new();
    for (_, partner) in &actionable {
        if let Some(p) = partner {
            if !partner_ids.iter().any(|q| q.id == p.id) {
                partner_ids.push(p);
            }
        }
    }
    let partner_results = join_all(partner_ids.iter().map(|p| fetch_report(source, p))).await;
    let mut partners: HashMap<String, SourceReport> = HashMap::new();
    for (item, result) in partner_ids.iter().zip(partner_results) {
        match result {
            Ok(r) => {
                partners.insert(item.id.clone(), r);
            }
            Err(e) => warn!(telegram = %item.id, "partner fetch failed; persisting unpaired: {e:#}"),
        }
    }

    for (quick, partner) in actionable {
        let detailed = partner.and_then(|p| partners.get(&p.id).cloned());
        if detailed.is_some() {
            report.paired += 1;
        }
        let bundle = SourceBundle { quick, detailed };
        let Some(info) = bundle.extract() else {
            report.failed += 1;
            continue;
        };
        match records::persist(db, &bundle, &info, master, cfg.dedup_scope) {
            Ok(PersistOutcome::Created(id)) => report.created.push(id),
            Ok(PersistOutcome::DuplicateRaw | PersistOutcome::DuplicateRecord { .. }) => {
                report.duplicates += 1
            }
            Ok(PersistOutcome::Stale { existing_serial }) => {
                debug!(event = %info.event_id, serial = info.serial_no, existing_serial, "stale serial ignored");
                report.stale += 1;
            }
            Err(e) => {
                warn!(event = %info.event_id, "persist failed: {e:#}");
                report.failed += 1;
            }
        }
    }

    info!("fetch cycle: {report}");
    Ok(report)
}
