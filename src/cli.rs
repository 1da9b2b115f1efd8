//! Command-line interface and server configuration
//!
//! Every option can also come from a `CIMA_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use thiserror::Error;

use crate::cache::DEFAULT_MAX_RETRIES;
use crate::data::client::DEFAULT_BASE_URL;

/// Default read timeout for dataset downloads, in seconds
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

/// Subdirectory of the data dir that holds the downloaded datasets
pub const DATASETS_SUBDIR: &str = "documentacion";

/// Error types for CLI argument validation
#[derive(Debug, Error)]
pub enum CliError {
    /// Host and port do not form a socket address
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),
}

/// REST wrapper around the CIMA (AEMPS) medicines registry
#[derive(Parser, Debug)]
#[command(name = "cima-proxy")]
#[command(about = "REST wrapper around the CIMA (AEMPS) medicines registry")]
#[command(version)]
pub struct Cli {
    /// Address to bind
    #[arg(long, env = "CIMA_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on (1-65535)
    #[arg(long, env = "CIMA_PORT", default_value_t = 8000, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Directory for downloaded datasets (defaults to the platform data dir)
    #[arg(long, env = "CIMA_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the CIMA REST API
    #[arg(long, env = "CIMA_UPSTREAM_URL", default_value = DEFAULT_BASE_URL)]
    pub upstream_url: String,

    /// Read timeout for dataset downloads, in seconds
    #[arg(long, env = "CIMA_DOWNLOAD_TIMEOUT", default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS)]
    pub download_timeout: u64,

    /// Attempts per dataset download before giving up
    #[arg(long, env = "CIMA_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_retries: u32,

    /// Use the newest cached datasets without contacting the network
    #[arg(long)]
    pub skip_refresh: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration derived from CLI arguments for server startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub upstream_url: String,
    /// Where the dated dataset files live
    pub datasets_dir: PathBuf,
    pub download_timeout: Duration,
    pub max_retries: u32,
    pub skip_refresh: bool,
}

impl ServerConfig {
    /// Creates a ServerConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` with the listen address resolved
    /// * `Err(CliError)` if host and port do not form an address
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let addr_text = if cli.host.contains(':') && !cli.host.starts_with('[') {
            format!("[{}]:{}", cli.host, cli.port)
        } else {
            format!("{}:{}", cli.host, cli.port)
        };
        let addr = addr_text
            .parse::<SocketAddr>()
            .map_err(|_| CliError::InvalidAddress(addr_text.clone()))?;

        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

        Ok(Self {
            addr,
            upstream_url: cli.upstream_url.clone(),
            datasets_dir: data_dir.join(DATASETS_SUBDIR),
            download_timeout: Duration::from_secs(cli.download_timeout),
            max_retries: cli.max_retries,
            skip_refresh: cli.skip_refresh,
        })
    }
}

/// Platform data directory for the service, or `./data` when unavailable
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("es", "aemps", "cima-proxy")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}
