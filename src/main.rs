//! # topicsync-server
//!
//! Entry point: parse CLI flags (which override the config file), init
//! logging, build the multi-threaded async runtime, and run the WebSocket
//! server until the process is stopped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use topicsync::config::ServerConfig;
use topicsync::server::Server;
use topicsync::transport;

/// A synchronized-topic broker: typed, replicated state cells kept in sync
/// across many WebSocket clients.
#[derive(Parser, Debug)]
#[command(name = "topicsync-server", version, about)]
struct Cli {
    /// Path to a TOML config file. Missing file falls back to defaults.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Overrides `host` from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Overrides `port` from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides `log_level` from the config file (also settable via RUST_LOG).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(&cli.config).unwrap_or_else(|_| ServerConfig::default());
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        info!("starting topicsync-server on {}:{}", config.host, config.port);
        let server = Arc::new(Server::new(config));
        transport::serve(server).await
    })
}
