use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow_server::{HttpPlane, MessageBus, MqttBus, Overrides, ServerConfig};

/// Tunnel server - forwards public HTTP requests to clients over MQTT
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "HTTP tunnel server over an MQTT message bus")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// IP address or host name to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT broker address (tcp://host:port)
    #[arg(short, long)]
    broker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow_server=info".parse()?)
                .add_directive("burrow_protocol=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel server with config: {}", args.config);

    let overrides = Overrides {
        bind_host: args.host,
        bind_port: args.port,
        broker: args.broker,
    };
    let config = ServerConfig::load_and_resolve(&args.config, &overrides)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    let bind_addr = config.bind_addr().await?;

    tracing::info!(
        "MQTT broker: {}:{}",
        config.broker.host,
        config.broker.port
    );
    tracing::info!(
        "Reply timeout: {}s",
        config.wait_policy.reply_timeout.as_secs()
    );

    let bus = MqttBus::connect(&config.mqtt_settings())
        .await
        .context("Failed to connect to the MQTT broker")?;

    let http_plane = HttpPlane::with_limits(
        bus.clone() as Arc<dyn MessageBus>,
        config.wait_policy,
        config.serve_limits,
    );

    tokio::select! {
        result = http_plane.run(bind_addr) => {
            tracing::error!("HTTP plane stopped: {:?}", result);
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    if let Err(e) = bus.shutdown().await {
        tracing::warn!("MQTT shutdown failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
