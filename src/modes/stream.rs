use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use crate::crypto::SecretKey;
use crate::fetcher::resolve_api_key;
use crate::realtime::connection::{StreamCfg, StreamHandles, Supervisor};
use crate::upstream::DmdataClient;

use super::shared::{ctrl_c, open_store};

/// Print the newest live event on every change until Ctrl-C, then ask the
/// supervisor to stop.
async fn watch_live(mut handles: StreamHandles, shutdown: watch::Sender<bool>) -> StreamHandles {
    let stop = ctrl_c();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("Ctrl-C received; closing stream");
                break;
            }
            changed = handles.events.changed() => {
                if changed.is_err() {
                    break;
                }
                let events = handles.events.borrow_and_update().clone();
                if let Some(latest) = events.first() {
                    println!("{latest}");
                }
                info!(events = events.len(), "live list updated");
            }
        }
    }
    shutdown.send_replace(true);
    handles
}

pub(super) async fn run() -> Result<()> {
    let db = open_store()?;
    let secret = SecretKey::from_env()?;
    let key = resolve_api_key(&db, secret.as_ref())?;
    let client = DmdataClient::from_env(key);
    let cfg = StreamCfg::from_env();
    info!("Upstream: {client}");
    info!("Stream config: {cfg}");

    let (supervisor, handles) = Supervisor::new(client, cfg);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ((), handles) = tokio::join!(supervisor.run(shutdown_rx), watch_live(handles, shutdown_tx));

    info!(status = ?*handles.status.borrow(), "stream stopped");
    Ok(())
}
