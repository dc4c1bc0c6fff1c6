//! slotmux - slot-aware load balancer for LLM inference servers
//!
//! This binary serves three listeners: the reverse proxy (inference
//! traffic), the management API (agent registration), and an optional
//! Prometheus metrics endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use slotmux::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "slotmux")]
#[command(about = "Slot-aware load balancer for LLM inference servers")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Management API port (overrides config)
    #[arg(short, long)]
    management_port: Option<u16>,

    /// Metrics port (overrides config; 0 disables)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("slotmux=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting slotmux");

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.management_port {
        config.management_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }

    info!(
        port = config.port,
        management_port = config.management_port,
        "Configuration loaded"
    );

    // Build the application
    let (app, metrics_router, management_router) =
        slotmux::build_app(&config).context("Failed to build application")?;

    // Spawn metrics server if enabled
    if let Some(metrics_router) = metrics_router {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    // Spawn management API server
    let management_addr = format!("0.0.0.0:{}", config.management_port);
    let management_listener = TcpListener::bind(&management_addr)
        .await
        .with_context(|| format!("Failed to bind management API to {}", management_addr))?;
    info!(addr = %management_addr, "Serving management API");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(management_listener, management_router).await {
            tracing::error!(error = %e, "Management server error");
        }
    });

    // Start the proxy server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
