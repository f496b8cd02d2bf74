mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use log::info;
use rkstacks::api::store::RegistryStore;
use rkstacks::config::load_config;
use rkstacks::controllers::{CONTROLLER_MANAGER, StackSetController};
use std::sync::Arc;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::init();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().unwrap())?;
            let endpoints: Vec<&str> = cfg
                .xline_config
                .endpoints
                .iter()
                .map(|s| s.as_str())
                .collect();
            let store = Arc::new(RegistryStore::new(&endpoints).await?);

            let manager = CONTROLLER_MANAGER.clone();
            let controller = Arc::new(RwLock::new(StackSetController::new(store.clone())));
            manager.clone().register(controller, cfg.workers).await?;
            manager.clone().start_watch(store).await?;
            info!("stackset controller started");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            manager.shutdown();
        }
    }

    Ok(())
}
