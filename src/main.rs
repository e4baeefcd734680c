//! graphwire - chunked transport server for remote graph query execution.
//!
//! Runs the protocol server with the loopback session, which echoes
//! statements back as records.

use graphwire_protocol::ProtocolVersion;
use graphwire_server::config::CONFIG_ENV;
use graphwire_server::{run_metrics_server, Config, LoopbackSession, Metrics, Server, ServerConfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if GRAPHWIRE_CONFIG is set, then env overrides)
    let config_path = std::env::var(CONFIG_ENV).ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting graphwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Protocol versions: {:?}",
        ProtocolVersion::SUPPORTED.map(|v| v.number())
    );
    tracing::info!("  Execution: {:?}", config.transport.execution);
    let framing = config
        .transport
        .framing_for(ProtocolVersion::SUPPORTED[0].framing());
    tracing::info!(
        "  Output buffer: {} bytes, max message: {} bytes",
        framing.output_buffer_size,
        framing.max_message_size
    );

    let mut server_config = ServerConfig::from_config(&config);
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, LoopbackSession::factory()));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
