use anyhow::{Result, anyhow};
use std::time::Duration;
use tracing::info;

use crate::realtime::connection::StreamCfg;
use crate::realtime::{Decoder, Reaction};

use super::shared::{load_recorded_frames, load_replay_cfg};

pub(super) async fn run() -> Result<()> {
    let replay = load_replay_cfg()?;
    let frames = load_recorded_frames(&replay.input_path)?;
    if frames.is_empty() {
        return Err(anyhow!("Replay input is empty: {}", replay.input_path));
    }

    let mut decoder = Decoder::new(StreamCfg::from_env().live_cap);
    info!("Replay started: {} frames from {}", frames.len(), replay.input_path);

    let mut applied = 0usize;
    let mut ignored = 0usize;

    for (idx, frame) in frames.iter().enumerate() {
        if idx > 0 {
            let delay_ms = replay.delay_ms(frame.timestamp - frames[idx - 1].timestamp);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        match decoder.handle(&frame.frame) {
            Reaction::Applied { event_id, change } => {
                applied += 1;
                if let Some(event) = decoder.live().get(&event_id) {
                    println!("[REPLAY {} {:?}] {event}", idx + 1, change);
                }
            }
            Reaction::Upstream { message, .. } => info!("recorded error frame: {message}"),
            _ => ignored += 1,
        }
    }

    info!(
        "Replay complete: total={}, applied={}, ignored={}",
        frames.len(),
        applied,
        ignored
    );
    println!("\nLive events ({}):", decoder.live().len());
    for event in decoder.live().events() {
        println!("  {event}");
    }
    Ok(())
}
