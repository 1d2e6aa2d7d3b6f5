//! Per-component heartbeat rows read by the external dashboard.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlite::State;
use std::fmt;

use super::{SharedDb, bool_col, lock};

const HEALTHY_WITHIN_SECS: i64 = 90;
const WARNING_WITHIN_SECS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

pub fn classify(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Health {
    let Some(last) = last_run else {
        return Health::Error;
    };
    let age = (now - last).num_seconds();
    if age <= HEALTHY_WITHIN_SECS {
        Health::Healthy
    } else if age <= WARNING_WITHIN_SECS {
        Health::Warning
    } else {
        Health::Error
    }
}

#[derive(Debug, Clone)]
pub struct Beat {
    pub last_run_at: DateTime<Utc>,
    pub ok: bool,
    pub detail: Option<String>,
}

pub fn record(db: &SharedDb, component: &str, at: DateTime<Utc>, ok: bool, detail: &str) -> Result<()> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "INSERT INTO heartbeats (component, last_run_at, ok, detail) VALUES (?, ?, ?, ?)
         ON CONFLICT(component) DO UPDATE SET
             last_run_at = excluded.last_run_at, ok = excluded.ok, detail = excluded.detail",
    )?;
    stmt.bind((1, component))?;
    stmt.bind((2, at.to_rfc3339().as_str()))?;
    stmt.bind((3, bool_col(ok)))?;
    stmt.bind((4, detail))?;
    stmt.next()?;
    Ok(())
}

pub fn last(db: &SharedDb, component: &str) -> Result<Option<Beat>> {
    let conn = lock(db)?;
    let mut stmt =
        conn.prepare("SELECT last_run_at, ok, detail FROM heartbeats WHERE component = ?")?;
    stmt.bind((1, component))?;
    if let State::Done = stmt.next()? {
        return Ok(None);
    }
    let raw = stmt.read::<String, _>(0)?;
    let Ok(at) = DateTime::parse_from_rfc3339(&raw) else {
        return Ok(None);
    };
    Ok(Some(Beat {
        last_run_at: at.with_timezone(&Utc),
        ok: stmt.read::<i64, _>(1)? != 0,
        detail: stmt.read::<Option<String>, _>(2)?,
    }))
}
