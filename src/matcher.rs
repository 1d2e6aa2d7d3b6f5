//! Notification matcher: fans a new record out to every enabled channel of
//! every workspace whose condition it satisfies.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::intensity;
use crate::store::SharedDb;
use crate::store::notifications;
use crate::store::records::{self, StoredRecord};
use crate::store::workspaces::{self, NotificationCondition};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MatchReport {
    pub conditions_matched: usize,
    /// Newly queued notification ids.
    pub queued: Vec<i64>,
    /// Triples that were already queued.
    pub existing: usize,
}

/// Does `record` satisfy `cond`?  Conditions whose floor is not an
/// intensity never match.
pub fn condition_matches(cond: &NotificationCondition, record: &StoredRecord) -> bool {
    let Some(floor) = intensity::parse_floor(&cond.min_intensity) else {
        warn!(condition = cond.id, floor = %cond.min_intensity, "unparseable intensity floor; condition skipped");
        return false;
    };
    let observed = record.max_intensity.as_deref().unwrap_or("");
    if !intensity::meets(observed, floor) {
        return false;
    }

    if let Some(wanted) = cond.info_subtype.as_deref() {
        if record.info_subtype.as_deref().map(str::trim) != Some(wanted.trim()) {
            return false;
        }
    }

    // Targets may name a prefecture by code or by name.
    cond.target_prefectures.is_empty()
        || record.prefectures.iter().any(|p| {
            cond.target_prefectures
                .iter()
                .any(|t| t.trim() == p.code || t.trim() == p.name)
        })
}

pub fn match_record(db: &SharedDb, record_id: i64, purpose: &str) -> Result<MatchReport> {
    let record = records::load(db, record_id)?
        .with_context(|| format!("record {record_id} not found"))?;
    let conditions = workspaces::enabled_conditions(db)?;

    let mut report = MatchReport::default();
    for cond in &conditions {
        if !condition_matches(cond, &record) {
            debug!(record = record_id, condition = cond.id, "condition not met");
            continue;
        }
        report.conditions_matched += 1;
        for channel in workspaces::enabled_channels(db, cond.workspace_id, purpose)? {
            match notifications::ensure_pending(db, record_id, cond.workspace_id, &channel.channel_id)? {
                Some(id) => report.queued.push(id),
                None => report.existing += 1,
            }
        }
    }

    info!(
        record = record.id,
        event = %record.event_id,
        serial = record.serial_no,
        matched = report.conditions_matched,
        queued = report.queued.len(),
        "matched record"
    );
    Ok(report)
}
