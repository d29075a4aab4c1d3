//! Wirehub Server
//!
//! Run with: cargo run --bin wirehub
//!
//! # Configuration
//!
//! Loaded from `--config <path>`, or the default locations
//! (`$XDG_CONFIG_HOME/wirehub/config.toml`, `/etc/wirehub/config.toml`,
//! `./config.toml`), with `WIREHUB_*` environment overrides. CLI flags
//! win over both. `RUST_LOG` overrides the configured log level.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wirehub::config::{generate_default_config, Config};
use wirehub::server::{serve, AppState};

#[derive(Debug, Parser)]
#[command(name = "wirehub", version, about = "Real-time WebSocket messaging relay")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listener host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listener port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);

    tracing::info!("Starting wirehub v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Relay endpoints: /server (upstream), /client; hub endpoint: {}",
        config.hub.path
    );

    let state = AppState::new(config);
    serve(state).await?;

    tracing::info!("wirehub stopped");
    Ok(())
}

/// Initialize the tracing subscriber from the logging config
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "wirehub={},tower_http=info",
            config.logging.level
        ))
    });

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
