mod crypto;
mod dispatch;
mod env;
mod fetcher;
mod intensity;
mod matcher;
mod modes;
mod realtime;
mod store;
mod telegram;
mod upstream;

use anyhow::Result;
use dotenvy::dotenv;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();
    modes::run_from_env().await
}
