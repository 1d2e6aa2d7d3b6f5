//! Dedup & persistence gateway for earthquake records.
//!
//! Two dedup layers run inside one transaction:
//!
//! * raw layer: `(event_id, fingerprint)` over the source envelopes.  A row
//!   that already exists means this exact content was seen before.
//! * record layer: an existing record for the event (or event + serial,
//!   depending on [`DedupScope`]) is never re-inserted; late prefecture rows
//!   are attached to it instead.

use anyhow::{Context, Result, bail};
use sqlite::State;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::prefectures::PrefectureMaster;
use super::{SharedDb, in_transaction, last_insert_id, lock};
use crate::telegram::{Depth, EarthquakeInfo, SourceBundle};

/// Record-layer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    /// One record per event; later serials only contribute prefecture rows.
    Event,
    /// One record per `(event, serial)`.
    EventSerial,
}

impl FromStr for DedupScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(Self::Event),
            "event_serial" | "event+serial" => Ok(Self::EventSerial),
            other => bail!("unknown RECORD_DEDUP_SCOPE {other:?} (expected event|event_serial)"),
        }
    }
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Event => "event",
            Self::EventSerial => "event_serial",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Created(i64),
    /// Identical source content was already recorded.
    DuplicateRaw,
    /// A record for this event already exists.
    DuplicateRecord { record_id: i64, prefectures_added: usize },
    /// A higher serial for this event is already stored.
    Stale { existing_serial: i64 },
}

impl PersistOutcome {
    pub fn created_id(&self) -> Option<i64> {
        match self {
            Self::Created(id) => Some(*id),
            _ => None,
        }
    }
}

/// A prefecture observation resolved against the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPrefecture {
    pub code: String,
    pub name: String,
    pub max_intensity: String,
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub event_id: String,
    pub serial_no: i64,
    pub report_kind: String,
    pub info_subtype: Option<String>,
    pub epicenter: Option<String>,
    pub magnitude: Option<f64>,
    pub depth: Option<Depth>,
    pub max_intensity: Option<String>,
    pub raw_payload: String,
    pub prefectures: Vec<StoredPrefecture>,
}

/// Map observations to master codes, dropping (with a warning) any name the
/// master does not know.
pub fn resolve_prefectures(info: &EarthquakeInfo, master: &PrefectureMaster) -> Vec<StoredPrefecture> {
    info.prefectures
        .iter()
        .filter_map(|obs| match master.code_for(&obs.name) {
            Some(code) => Some(StoredPrefecture {
                code: code.to_string(),
                name: master.name_for(code).unwrap_or(&obs.name).to_string(),
                max_intensity: obs.max_intensity.clone(),
            }),
            None => {
                warn!(event = %info.event_id, prefecture = %obs.name, "unknown prefecture; observation dropped");
                None
            }
        })
        .collect()
}

pub fn persist(
    db: &SharedDb,
    bundle: &SourceBundle,
    info: &EarthquakeInfo,
    master: &PrefectureMaster,
    scope: DedupScope,
) -> Result<PersistOutcome> {
    let prefectures = resolve_prefectures(info, master);
    let fingerprint = bundle.fingerprint();
    let payload = bundle.to_payload()?;

    let conn = lock(db)?;
    let outcome = in_transaction(&conn, |conn| {
        let mut raw = conn.prepare(
            "INSERT OR IGNORE INTO raw_telegrams (event_id, fingerprint, telegram_id) VALUES (?, ?, ?)",
        )?;
        raw.bind((1, info.event_id.as_str()))?;
        raw.bind((2, fingerprint.as_str()))?;
        raw.bind((3, bundle.quick.item.id.as_str()))?;
        raw.next()?;
        drop(raw);
        if conn.change_count() == 0 {
            return Ok(PersistOutcome::DuplicateRaw);
        }

        if let Some((record_id, serial)) = existing_record(conn, info, scope)? {
            if serial > info.serial_no {
                return Ok(PersistOutcome::Stale {
                    existing_serial: serial,
                });
            }
            let prefectures_added = attach_prefectures(conn, record_id, &prefectures)?;
            return Ok(PersistOutcome::DuplicateRecord {
                record_id,
                prefectures_added,
            });
        }

        if let Some(latest) = latest_serial(conn, &info.event_id)? {
            if latest > info.serial_no {
                return Ok(PersistOutcome::Stale {
                    existing_serial: latest,
                });
            }
        }

        let record_id = insert_record(conn, info, &payload)?;
        attach_prefectures(conn, record_id, &prefectures)?;
        Ok(PersistOutcome::Created(record_id))
    })
    .with_context(|| format!("failed to persist event {}", info.event_id))?;

    match &outcome {
        PersistOutcome::Created(id) => info!(
            event = %info.event_id,
            serial = info.serial_no,
            record = id,
            prefectures = prefectures.len(),
            "earthquake record created"
        ),
        other => debug!(event = %info.event_id, serial = info.serial_no, ?other, "not re-inserted"),
    }
    Ok(outcome)
}

/// The record this info would collide with under `scope`, with its serial.
fn existing_record(
    conn: &sqlite::Connection,
    info: &EarthquakeInfo,
    scope: DedupScope,
) -> Result<Option<(i64, i64)>> {
    let mut stmt = match scope {
        DedupScope::Event => {
            let mut s = conn.prepare(
                "SELECT id, serial_no FROM earthquake_records WHERE event_id = ?
                 ORDER BY serial_no DESC LIMIT 1",
            )?;
            s.bind((1, info.event_id.as_str()))?;
            s
        }
        DedupScope::EventSerial => {
            let mut s = conn.prepare(
                "SELECT id, serial_no FROM earthquake_records WHERE event_id = ? AND serial_no = ?",
            )?;
            s.bind((1, info.event_id.as_str()))?;
            s.bind((2, info.serial_no))?;
            s
        }
    };
    match stmt.next()? {
        State::Row => Ok(Some((stmt.read::<i64, _>(0)?, stmt.read::<i64, _>(1)?))),
        State::Done => Ok(None),
    }
}

fn latest_serial(conn: &sqlite::Connection, event_id: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT MAX(serial_no) FROM earthquake_records WHERE event_id = ?")?;
    stmt.bind((1, event_id))?;
    match stmt.next()? {
        State::Row => Ok(stmt.read::<Option<i64>, _>(0)?),
        State::Done => Ok(None),
    }
}

fn insert_record(conn: &sqlite::Connection, info: &EarthquakeInfo, payload: &str) -> Result<i64> {
    let depth = info.depth.as_ref().map(Depth::to_column);
    let occurred = info.occurred_at.map(|t| t.to_rfc3339());
    let reported = info.reported_at.map(|t| t.to_rfc3339());

    let mut stmt = conn.prepare(
        "INSERT INTO earthquake_records
            (event_id, serial_no, report_kind, info_subtype, title, epicenter, magnitude,
             depth, max_intensity, occurred_at, reported_at, raw_payload)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    stmt.bind((1, info.event_id.as_str()))?;
    stmt.bind((2, info.serial_no))?;
    stmt.bind((3, info.report_kind.code()))?;
    stmt.bind((4, info.info_subtype.as_deref()))?;
    stmt.bind((5, info.title.as_deref()))?;
    stmt.bind((6, info.epicenter.as_deref()))?;
    stmt.bind((7, info.magnitude))?;
    stmt.bind((8, depth.as_deref()))?;
    stmt.bind((9, info.max_intensity.as_deref()))?;
    stmt.bind((10, occurred.as_deref()))?;
    stmt.bind((11, reported.as_deref()))?;
    stmt.bind((12, payload))?;
    stmt.next()?;
    drop(stmt);
    last_insert_id(conn)
}

/// Upsert-or-skip keyed by `(record_id, pref_code)`.  Returns the number of
/// rows actually added.
fn attach_prefectures(
    conn: &sqlite::Connection,
    record_id: i64,
    prefectures: &[StoredPrefecture],
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO earthquake_prefectures (record_id, pref_code, pref_name, max_intensity)
         VALUES (?, ?, ?, ?)",
    )?;
    let mut added = 0;
    for p in prefectures {
        stmt.reset()?;
        stmt.bind((1, record_id))?;
        stmt.bind((2, p.code.as_str()))?;
        stmt.bind((3, p.name.as_str()))?;
        stmt.bind((4, p.max_intensity.as_str()))?;
        stmt.next()?;
        added += conn.change_count();
    }
    Ok(added)
}

pub fn load(db: &SharedDb, record_id: i64) -> Result<Option<StoredRecord>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT id, event_id, serial_no, report_kind, info_subtype, epicenter, magnitude,
                depth, max_intensity, raw_payload
         FROM earthquake_records WHERE id = ?",
    )?;
    stmt.bind((1, record_id))?;
    if let State::Done = stmt.next()? {
        return Ok(None);
    }
    let mut record = StoredRecord {
        id: stmt.read::<i64, _>(0)?,
        event_id: stmt.read::<String, _>(1)?,
        serial_no: stmt.read::<i64, _>(2)?,
        report_kind: stmt.read::<String, _>(3)?,
        info_subtype: stmt.read::<Option<String>, _>(4)?,
        epicenter: stmt.read::<Option<String>, _>(5)?,
        magnitude: stmt.read::<Option<f64>, _>(6)?,
        depth: stmt
            .read::<Option<String>, _>(7)?
            .map(|d| Depth::from_column(&d)),
        max_intensity: stmt.read::<Option<String>, _>(8)?,
        raw_payload: stmt.read::<String, _>(9)?,
        prefectures: Vec::new(),
    };
    drop(stmt);

    let mut prefs = conn.prepare(
        "SELECT pref_code, pref_name, max_intensity FROM earthquake_prefectures
         WHERE record_id = ? ORDER BY pref_code",
    )?;
    prefs.bind((1, record_id))?;
    while let State::Row = prefs.next()? {
        record.prefectures.push(StoredPrefecture {
            code: prefs.read::<String, _>(0)?,
            name: prefs.read::<String, _>(1)?,
            max_intensity: prefs.read::<String, _>(2)?,
        });
    }
    Ok(Some(record))
}

/// Records stored for an event, any serial.
#[cfg(test)]
pub fn count_for_event(db: &SharedDb, event_id: &str) -> Result<i64> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare("SELECT COUNT(*) FROM earthquake_records WHERE event_id = ?")?;
    stmt.bind((1, event_id))?;
    stmt.next()?;
    Ok(stmt.read::<i64, _>(0)?)
}
