mod auth;
mod buffer_pool;
mod config;
mod logging;
mod registry;
mod server;
mod socks5;
mod tunnel;

use crate::buffer_pool::BufferPool;
use crate::config::{Cli, Config};
use crate::registry::Registry;
use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();

    // Configuration problems abort before the logger or any listener exists
    let config = Config::load(&args.config)?;
    let _log_guard = logging::init(&config.log)?;

    let pool = Arc::new(BufferPool::new(
        config.settings.read_buffer_size,
        config.settings.write_buffer_size,
    ));
    let registry = Registry::build(&config, Arc::clone(&pool))?;
    info!(
        who = "MGR",
        config = %args.config.display(),
        pairs = registry.len(),
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!(who = "MGR", "Shutdown signal received");
                trigger.cancel();
            }
            Err(e) => error!(who = "MGR", "fail to listen for shutdown signal: {}", e),
        }
    });

    let outcomes = registry.run(shutdown).await;
    let stats = pool.stats().await;
    info!(
        who = "MGR",
        idle = stats.idle_pairs,
        allocated = stats.allocated_pairs,
        idle_bytes = stats.idle_bytes,
        "buffer pool at exit"
    );
    let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
    if failed == outcomes.len() {
        return Err(eyre!("all {} socks5 proxies failed", failed));
    }
    Ok(())
}
