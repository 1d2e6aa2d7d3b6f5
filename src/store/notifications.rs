//! The `earthquake_notifications` queue: `pending → sent | failed`.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use sqlite::State;
use std::fmt;
use std::str::FromStr;

use super::{SharedDb, in_transaction, lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Sent,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown notification status {other:?}"),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: i64,
    pub record_id: i64,
    pub workspace_id: i64,
    pub channel_id: String,
    pub status: Status,
    pub message_ref: Option<String>,
    pub error_message: Option<String>,
}

/// Create a pending row for the triple unless one exists.  Returns the new id,
/// or `None` when the triple was already queued (in any state).
pub fn ensure_pending(
    db: &SharedDb,
    record_id: i64,
    workspace_id: i64,
    channel_id: &str,
) -> Result<Option<i64>> {
    let conn = lock(db)?;
    in_transaction(&conn, |conn| {
        let mut exists = conn.prepare(
            "SELECT id FROM earthquake_notifications
             WHERE record_id = ? AND workspace_id = ? AND channel_id = ?",
        )?;
        exists.bind((1, record_id))?;
        exists.bind((2, workspace_id))?;
        exists.bind((3, channel_id))?;
        if let State::Row = exists.next()? {
            return Ok(None);
        }
        drop(exists);

        // The unique key still guards against a concurrent writer.
        let mut insert = conn.prepare(
            "INSERT OR IGNORE INTO earthquake_notifications (record_id, workspace_id, channel_id, status)
             VALUES (?, ?, ?, 'pending')",
        )?;
        insert.bind((1, record_id))?;
        insert.bind((2, workspace_id))?;
        insert.bind((3, channel_id))?;
        insert.next()?;
        drop(insert);
        if conn.change_count() == 0 {
            return Ok(None);
        }
        super::last_insert_id(conn).map(Some)
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, record_id, workspace_id, channel_id, status, message_ref, error_message
     FROM earthquake_notifications";

fn read_row(stmt: &sqlite::Statement<'_>) -> Result<Notification> {
    Ok(Notification {
        id: stmt.read::<i64, _>(0)?,
        record_id: stmt.read::<i64, _>(1)?,
        workspace_id: stmt.read::<i64, _>(2)?,
        channel_id: stmt.read::<String, _>(3)?,
        status: stmt.read::<String, _>(4)?.parse()?,
        message_ref: stmt.read::<Option<String>, _>(5)?,
        error_message: stmt.read::<Option<String>, _>(6)?,
    })
}

/// Oldest-first pending rows that are unclaimed, or whose claim was taken
/// at or before `stale_before`.  At most `limit`.
pub fn pending_batch(db: &SharedDb, limit: usize, stale_before: DateTime<Utc>) -> Result<Vec<Notification>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(format!(
        "{SELECT_COLUMNS} WHERE status = 'pending' AND (claimed_at IS NULL OR claimed_at <= ?)
         ORDER BY created_at ASC, id ASC LIMIT ?"
    ))?;
    stmt.bind((1, stale_before.timestamp()))?;
    stmt.bind((2, limit as i64))?;
    let mut out = Vec::new();
    while let State::Row = stmt.next()? {
        out.push(read_row(&stmt)?);
    }
    Ok(out)
}

/// Take a pending row for delivery.  `false` when another pass holds a live
/// claim or the row is no longer pending; only the claimant may post.
pub fn claim(db: &SharedDb, id: i64, at: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<bool> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "UPDATE earthquake_notifications SET claimed_at = ?
         WHERE id = ? AND status = 'pending' AND (claimed_at IS NULL OR claimed_at <= ?)",
    )?;
    stmt.bind((1, at.timestamp()))?;
    stmt.bind((2, id))?;
    stmt.bind((3, stale_before.timestamp()))?;
    stmt.next()?;
    drop(stmt);
    Ok(conn.change_count() == 1)
}

#[cfg(test)]
pub fn get(db: &SharedDb, id: i64) -> Result<Option<Notification>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(format!("{SELECT_COLUMNS} WHERE id = ?"))?;
    stmt.bind((1, id))?;
    match stmt.next()? {
        State::Row => read_row(&stmt).map(Some),
        State::Done => Ok(None),
    }
}

#[cfg(test)]
pub fn for_record(db: &SharedDb, record_id: i64) -> Result<Vec<Notification>> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(format!("{SELECT_COLUMNS} WHERE record_id = ? ORDER BY id"))?;
    stmt.bind((1, record_id))?;
    let mut out = Vec::new();
    while let State::Row = stmt.next()? {
        out.push(read_row(&stmt)?);
    }
    Ok(out)
}

/// Terminal transitions only apply to rows still pending.
pub fn mark_sent(db: &SharedDb, id: i64, message_ref: &str, at: DateTime<Utc>) -> Result<bool> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "UPDATE earthquake_notifications
         SET status = 'sent', message_ref = ?, sent_at = ?, error_message = NULL
         WHERE id = ? AND status = 'pending'",
    )?;
    stmt.bind((1, message_ref))?;
    stmt.bind((2, at.to_rfc3339().as_str()))?;
    stmt.bind((3, id))?;
    stmt.next()?;
    drop(stmt);
    Ok(conn.change_count() > 0)
}

pub fn mark_failed(db: &SharedDb, id: i64, error: &str) -> Result<bool> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "UPDATE earthquake_notifications SET status = 'failed', error_message = ?
         WHERE id = ? AND status = 'pending'",
    )?;
    stmt.bind((1, error))?;
    stmt.bind((2, id))?;
    stmt.next()?;
    drop(stmt);
    Ok(conn.change_count() > 0)
}

/// Move failed rows back to pending: all of them, or only `ids`.
pub fn requeue_failed(db: &SharedDb, ids: Option<&[i64]>) -> Result<usize> {
    let conn = lock(db)?;
    in_transaction(&conn, |conn| match ids {
        None => {
            conn.execute(
                "UPDATE earthquake_notifications SET status = 'pending', error_message = NULL, claimed_at = NULL
                 WHERE status = 'failed'",
            )?;
            Ok(conn.change_count())
        }
        Some(ids) => {
            let mut stmt = conn.prepare(
                "UPDATE earthquake_notifications SET status = 'pending', error_message = NULL, claimed_at = NULL
                 WHERE id = ? AND status = 'failed'",
            )?;
            let mut moved = 0;
            for id in ids {
                stmt.reset()?;
                stmt.bind((1, *id))?;
                stmt.next()?;
                moved += conn.change_count();
            }
            Ok(moved)
        }
    })
}

#[cfg(test)]
pub fn count_for(db: &SharedDb, record_id: i64, workspace_id: i64, channel_id: &str) -> Result<i64> {
    let conn = lock(db)?;
    let mut stmt = conn.prepare(
        "SELECT COUNT(*) FROM earthquake_notifications
         WHERE record_id = ? AND workspace_id = ? AND channel_id = ?",
    )?;
    stmt.bind((1, record_id))?;
    stmt.bind((2, workspace_id))?;
    stmt.bind((3, channel_id))?;
    stmt.next()?;
    Ok(stmt.read::<i64, _>(0)?)
}

#[cfg(test)]
pub(crate) fn seed_record(db: &SharedDb, event_id: &str) -> i64 {
    let conn = lock(db).unwrap();
    conn.execute("INSERT OR IGNORE INTO workspaces (id, name) VALUES (1, 'ws')")
        .unwrap();
    let mut stmt = conn
        .prepare("INSERT INTO earthquake_records (event_id, serial_no, report_kind, raw_payload) VALUES (?, 1, 'VXSE51', '{}')")
        .unwrap();
    stmt.bind((1, event_id)).unwrap();
    stmt.next().unwrap();
    drop(stmt);
    super::last_insert_id(&conn).unwrap()
}
