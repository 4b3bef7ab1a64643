//! Eyelink -- server and eye in one binary.
//!
//! Usage:
//!   eyelink server                     # Discover and supervise eyes
//!   eyelink eye --name porch           # Register with a server and serve vision
//!   eyelink --config path.toml server  # Run with custom config
//!   eyelink config                     # Print the effective configuration

use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyelink_node::client::EyeClient;
use eyelink_node::config::NodeConfig;
use eyelink_node::expand_tilde;
use eyelink_node::server::Server;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "eyelink", about = "Camera eye discovery and supervision")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.eyelink/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server: discovery, registry, heartbeat supervision
    Server,
    /// Run an eye: register with the server and serve vision requests
    Eye {
        /// Name to register under (overrides [eye] name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eyelink=info,eyelink_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Server => run_server(cfg).await?,
        Commands::Eye { name } => run_eye(cfg, name).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&cfg)?),
    }

    Ok(())
}

async fn run_server(cfg: NodeConfig) -> anyhow::Result<()> {
    let settings = cfg.discovery_settings()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        discovery = %settings.bind,
        advertise_ip = %settings.advertise_ip,
        first_control_port = settings.first_control_port,
        "starting eyelink server"
    );

    let server = Server::start(settings, cfg.thumbnail_polling()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!(eyes = server.registry().len().await, "shutting down");
    server.shutdown().await;
    Ok(())
}

async fn run_eye(cfg: NodeConfig, name: Option<String>) -> anyhow::Result<()> {
    let config = cfg.eye_client(name)?;
    let provider = Arc::new(cfg.vision_provider());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        eye = %config.name,
        target = %config.discovery.target,
        "starting eyelink eye"
    );

    let cancel = CancellationToken::new();
    let discovery = EyeClient::connect(config, provider, cancel.clone());
    let client = tokio::select! {
        client = discovery => client?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            return Ok(());
        }
    };
    let Some(client) = client else {
        tracing::error!("no server answered; giving up");
        return Ok(());
    };

    let interrupted = tokio::select! {
        _ = client.disconnected() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        tracing::info!(eye = %client.name(), "shutting down");
        client.shutdown().await;
    } else {
        tracing::error!(eye = %client.name(), "lost connection to server");
    }
    Ok(())
}
