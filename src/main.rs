use std::net::SocketAddr;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use linkguard::app::build_state;
use linkguard::config::LinkguardConfig;
use linkguard::http::{router, HttpServer};
use linkguard::ratelimit::Environment;

/// Rate limiting and state token service for wallet linking.
#[derive(Debug, Parser)]
#[command(name = "linkguard", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "LINKGUARD_CONFIG")]
    config: Option<String>,

    /// Override the configured environment (production or development)
    #[arg(short, long)]
    environment: Option<Environment>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long, env = "LINKGUARD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Linkguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = LinkguardConfig::load(args.config.as_deref())?;
    if let Some(environment) = args.environment {
        config.environment = environment;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        environment = %config.environment,
        http_addr = %config.server.http_addr,
        "Configuration loaded"
    );

    let state = build_state(&config).map_err(|e| {
        error!(error = %e, "Refusing to start");
        e
    })?;

    // Surface an unreachable backend at boot rather than on the first request.
    let controller = state.guard.controller().clone();
    let now_ms = controller.clock().now_ms();
    if controller.connection().probe(now_ms).await {
        info!("Counter store reachable");
    } else {
        warn!("Counter store unreachable at startup");
    }

    let server = HttpServer::new(config.server.http_addr, router(state));
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Linkguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
