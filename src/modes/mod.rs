mod admin;
mod poll;
mod replay;
mod shared;
mod stream;

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Poll,
    Stream,
    Replay,
    Dispatch,
    Requeue,
    Health,
    Seal,
}

impl RunMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "stream" | "live" => Self::Stream,
            "replay" => Self::Replay,
            "dispatch" => Self::Dispatch,
            "requeue" => Self::Requeue,
            "health" => Self::Health,
            "seal" => Self::Seal,
            _ => Self::Poll,
        }
    }

    fn from_env() -> Self {
        Self::parse(&std::env::var("RUN_MODE").unwrap_or_else(|_| "poll".into()))
    }
}

pub async fn run_from_env() -> Result<()> {
    match RunMode::from_env() {
        RunMode::Poll => poll::run().await,
        RunMode::Stream => stream::run().await,
        RunMode::Replay => replay::run().await,
        RunMode::Dispatch => admin::dispatch_once().await,
        RunMode::Requeue => admin::requeue(),
        RunMode::Health => admin::health(),
        RunMode::Seal => admin::seal(),
    }
}
