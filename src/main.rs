mod cancel;
mod catalog;
mod config;
mod container;
mod diff;
mod download;
mod errors;
mod heal;
mod install;
mod launch;
mod logging;
mod patch;
mod remote;
mod rpc;
mod signature;
mod upload;
mod utils;

use std::sync::Arc;

use clap::Parser;

use crate::cancel::CancelRegistry;
use crate::catalog::queries::SettingsQueries;
use crate::config::DaemonConfig;
use crate::download::DownloadScheduler;
use crate::errors::Result;
use crate::launch::session::SessionTracker;
use crate::remote::ApiClient;
use crate::rpc::RpcState;

#[tokio::main]
async fn main() {
    let config = DaemonConfig::parse();
    if let Err(err) = run(config).await {
        eprintln!("caved: fatal: {err}");
        logging::flush();
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    logging::init(&config.log_dir())?;
    tracing::info!(transport = ?config.transport, address = %config.address, "caved starting");

    let catalog = catalog::init(&config)?;
    let base_url = catalog.get_setting("api_base_url")?.unwrap_or_else(|| "https://api.itch.io".to_string());
    let api_key = catalog.get_setting("api_key")?;

    spawn_destiny_watch(&config);

    let state = Arc::new(RpcState {
        cancel_registry: CancelRegistry::new(),
        downloads: DownloadScheduler::new(),
        sessions: SessionTracker::new(ApiClient::new(base_url, api_key)),
        secret: rpc::generate_secret(),
        catalog,
        config: config.clone(),
    });

    rpc::serve(config, state).await
}

/// Terminates the daemon if any `--destiny-pid` parent process dies, so an
/// orphaned daemon never outlives the front-end that spawned it.
fn spawn_destiny_watch(config: &DaemonConfig) {
    let pids = config.destiny_pids.clone();
    if pids.is_empty() {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            if pids.iter().any(|pid| !process_is_alive(*pid)) {
                tracing::warn!("caved: a destiny pid exited, shutting down");
                logging::flush();
                std::process::exit(0);
            }
        }
    });
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    true
}
