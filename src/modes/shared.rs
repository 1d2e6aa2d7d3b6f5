use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use crate::env::{env_or, env_parse, must_env};
use crate::realtime::connection::RecordedFrame;
use crate::store::{self, SharedDb};

pub(super) fn open_store() -> Result<SharedDb> {
    let path = env_or("DB_PATH", "./shindo_relay.sqlite");
    store::open_db(&path).with_context(|| format!("failed to open store at {path}"))
}

/// | Env var                  | Default      | Description                     |
/// |--------------------------|--------------|---------------------------------|
/// | `POLL_INTERVAL_SECS`     | `60`         | fetch cycle interval            |
/// | `DISPATCH_INTERVAL_SECS` | `60`         | straggler dispatch interval     |
/// | `NOTIFY_PURPOSE`         | `earthquake` | channel purpose for the matcher |
#[derive(Clone)]
pub(super) struct PollCfg {
    pub interval: Duration,
    pub dispatch_interval: Duration,
    pub purpose: String,
}

impl PollCfg {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", 60u64).max(1)),
            dispatch_interval: Duration::from_secs(env_parse("DISPATCH_INTERVAL_SECS", 60u64).max(1)),
            purpose: env_or("NOTIFY_PURPOSE", "earthquake"),
        }
    }
}

impl fmt::Display for PollCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PollCfg(interval={}s, dispatch_interval={}s, purpose={})",
            self.interval.as_secs(),
            self.dispatch_interval.as_secs(),
            self.purpose
        )
    }
}

#[derive(Clone)]
pub(super) struct ReplayCfg {
    pub input_path: String,
    pub speed: f64,
    pub fixed_step_ms: Option<u64>,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReplayCfg {
    /// Pause before a frame recorded `delta_ms` after the previous one.
    pub fn delay_ms(&self, delta_ms: i64) -> u64 {
        if let Some(step_ms) = self.fixed_step_ms {
            return step_ms;
        }
        let scaled = (delta_ms.max(0) as f64 / self.speed).round() as u64;
        scaled.clamp(self.min_delay_ms, self.max_delay_ms.max(self.min_delay_ms))
    }
}

pub(super) fn load_replay_cfg() -> Result<ReplayCfg> {
    Ok(ReplayCfg {
        input_path: must_env("REPLAY_INPUT_PATH")?,
        speed: Some(env_parse("REPLAY_SPEED", 1.0f64))
            .filter(|v| *v > 0.0)
            .unwrap_or(1.0),
        fixed_step_ms: Some(env_parse("REPLAY_STEP_MS", 0u64)).filter(|v| *v > 0),
        min_delay_ms: env_parse("REPLAY_MIN_DELAY_MS", 0),
        max_delay_ms: env_parse("REPLAY_MAX_DELAY_MS", 10_000),
    })
}

/// Frames recorded by the stream mode, oldest first.
pub(super) fn load_recorded_frames(path: &str) -> Result<Vec<RecordedFrame>> {
    let file = File::open(path).with_context(|| format!("failed to open replay file {path}"))?;
    let reader = BufReader::new(file);

    let mut frames = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: RecordedFrame =
            serde_json::from_str(&line).with_context(|| format!("invalid JSON at line {}", idx + 1))?;
        frames.push(frame);
    }

    frames.sort_by_key(|f| f.timestamp);
    Ok(frames)
}

/// Resolves on the first Ctrl-C.
pub(super) async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
