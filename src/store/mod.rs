//! SQLite persistence: schema, connection sharing, transactions.

pub mod heartbeat;
pub mod notifications;
pub mod prefectures;
pub mod records;
pub mod workspaces;

use anyhow::{Context, Result, anyhow};
use sqlite::State;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Shared database handle
// ---------------------------------------------------------------------------

pub type SharedDb = Arc<Mutex<sqlite::Connection>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prefectures (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS raw_telegrams (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    telegram_id TEXT NOT NULL,
    received_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (event_id, fingerprint)
);
CREATE TABLE IF NOT EXISTS earthquake_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id      TEXT NOT NULL,
    serial_no     INTEGER NOT NULL,
    report_kind   TEXT NOT NULL,
    info_subtype  TEXT,
    title         TEXT,
    epicenter     TEXT,
    magnitude     REAL,
    depth         TEXT,
    max_intensity TEXT,
    occurred_at   TEXT,
    reported_at   TEXT,
    raw_payload   TEXT NOT NULL,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (event_id, serial_no)
);
CREATE TABLE IF NOT EXISTS earthquake_prefectures (
    record_id     INTEGER NOT NULL REFERENCES earthquake_records(id),
    pref_code     TEXT NOT NULL,
    pref_name     TEXT NOT NULL,
    max_intensity TEXT NOT NULL,
    PRIMARY KEY (record_id, pref_code)
);
CREATE TABLE IF NOT EXISTS workspaces (
    id                   INTEGER PRIMARY KEY,
    name                 TEXT NOT NULL,
    bot_token_ciphertext TEXT,
    bot_token_iv         TEXT,
    bot_token_tag        TEXT,
    is_active            INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS notification_channels (
    id           INTEGER PRIMARY KEY,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
    channel_id   TEXT NOT NULL,
    purpose      TEXT NOT NULL,
    is_enabled   INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS notification_conditions (
    id                 INTEGER PRIMARY KEY,
    workspace_id       INTEGER NOT NULL REFERENCES workspaces(id),
    min_intensity      TEXT NOT NULL,
    info_subtype       TEXT,
    target_prefectures TEXT NOT NULL DEFAULT '[]',
    is_enabled         INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS departments (
    id           INTEGER PRIMARY KEY,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
    name         TEXT NOT NULL,
    emoji        TEXT,
    sort_order   INTEGER NOT NULL DEFAULT 0,
    is_active    INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS message_templates (
    id           INTEGER PRIMARY KEY,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
    title        TEXT NOT NULL,
    body         TEXT NOT NULL,
    is_active    INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS earthquake_notifications (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id     INTEGER NOT NULL REFERENCES earthquake_records(id),
    workspace_id  INTEGER NOT NULL REFERENCES workspaces(id),
    channel_id    TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'pending',
    message_ref   TEXT,
    error_message TEXT,
    sent_at       TEXT,
    claimed_at    INTEGER,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (record_id, workspace_id, channel_id)
);
CREATE INDEX IF NOT EXISTS idx_notifications_status
    ON earthquake_notifications (status, created_at);
CREATE TABLE IF NOT EXISTS api_credentials (
    id         INTEGER PRIMARY KEY,
    provider   TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    iv         TEXT NOT NULL,
    auth_tag   TEXT NOT NULL,
    is_active  INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS heartbeats (
    component   TEXT PRIMARY KEY,
    last_run_at TEXT NOT NULL,
    ok          INTEGER NOT NULL,
    detail      TEXT
);
";

/// Open (or create) the database and ensure the schema and prefecture
/// master exist.
pub fn open_db(path: &str) -> Result<SharedDb> {
    let conn = sqlite::open(path).with_context(|| format!("failed to open database {path}"))?;
    conn.execute("PRAGMA busy_timeout = 5000;")?;
    conn.execute(SCHEMA).context("failed to create schema")?;
    prefectures::seed(&conn)?;
    info!("Database opened at {path}");
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn lock(db: &SharedDb) -> Result<MutexGuard<'_, sqlite::Connection>> {
    db.lock().map_err(|_| anyhow!("database mutex poisoned"))
}

/// Run `f` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on error.
pub fn in_transaction<T>(
    conn: &sqlite::Connection,
    f: impl FnOnce(&sqlite::Connection) -> Result<T>,
) -> Result<T> {
    conn.execute("BEGIN IMMEDIATE;")?;
    match f(conn) {
        Ok(value) => match conn.execute("COMMIT;") {
            Ok(()) => Ok(value),
            Err(e) => {
                rollback(conn);
                Err(anyhow::Error::new(e).context("commit failed"))
            }
        },
        Err(e) => {
            rollback(conn);
            Err(e)
        }
    }
}

/// The connection must never be left inside an open transaction.
fn rollback(conn: &sqlite::Connection) {
    if let Err(rb) = conn.execute("ROLLBACK;") {
        warn!("rollback failed: {rb}");
    }
}

pub fn last_insert_id(conn: &sqlite::Connection) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT last_insert_rowid()")?;
    match stmt.next()? {
        State::Row => Ok(stmt.read::<i64, _>(0)?),
        State::Done => Err(anyhow!("last_insert_rowid returned no row")),
    }
}

pub fn bool_col(v: bool) -> i64 {
    i64::from(v)
}

#[cfg(test)]
pub(crate) fn open_memory() -> SharedDb {
    open_db(":memory:").expect("in-memory database")
}
