use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sentinel::config::SentinelConfig;
use sentinel::http::HttpServer;
use sentinel::ratelimit::RateLimiter;

/// Per-client request admission service.
#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "SENTINEL_CONFIG")]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Starting Sentinel");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration is fatal before anything is served
    let mut config = SentinelConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let settings = config.rate_limiting.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?settings.backend,
        limit = settings.anonymous.limit,
        token_limit = settings.token.limit,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let rate_limiter = Arc::new(RateLimiter::connect(settings, shutdown.clone()).await?);
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, Arc::clone(&rate_limiter));

    // Run the server with graceful shutdown on Ctrl+C
    let signal_token = shutdown.clone();
    server
        .serve_with_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    rate_limiter.storage().stop().await;

    info!("Sentinel stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
