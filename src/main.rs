//! CIMA proxy - REST wrapper around the AEMPS medicines registry
//!
//! Refreshes the cached reference datasets, then serves the API.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use cima_proxy::api::{router, AppState};
use cima_proxy::cli::{Cli, ServerConfig};
use cima_proxy::data::{CimaClient, Datasets};
use cima_proxy::startup::{cached_datasets, http_downloader, prepare_datasets, DatasetConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = ServerConfig::from_cli(&cli)?;
    let datasets = match load(&config).await {
        Ok(datasets) => datasets,
        Err(e) => {
            error!(error = %e, "startup failed");
            return Err(e);
        }
    };

    let client = CimaClient::with_base_url(config.upstream_url.clone())?;
    let app = router(AppState::new(client, datasets));

    let listener = TcpListener::bind(config.addr).await?;
    info!(addr = %config.addr, upstream = %config.upstream_url, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Prepares the datasets per configuration
async fn load(config: &ServerConfig) -> Result<Datasets, Box<dyn std::error::Error>> {
    let datasets = DatasetConfig::new(&config.datasets_dir);
    if config.skip_refresh {
        info!(dir = %datasets.dir.display(), "skipping dataset refresh");
        return Ok(cached_datasets(&datasets).await?);
    }

    let downloader = http_downloader(config.download_timeout, config.max_retries)?;
    Ok(prepare_datasets(&datasets, &downloader).await?)
}
