use anyhow::Context;
use clap::Parser;
use kitsvc_delivery::{
    api::{build_router, AppState},
    config::Config,
    service::DeliveryService,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kitsvc-delivery", version, about = "Outbound delivery and event replay service")]
struct Cli {
    /// Configuration file, layered over the embedded defaults
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(
        &config.observability.log_level,
        cli.json_logs || config.observability.json_logs,
    );

    tracing::info!("Starting kitsvc-delivery v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = kitsvc_delivery::metrics::init_metrics() {
        tracing::warn!("Failed to initialize metrics: {}", e);
        tracing::warn!("Continuing without metrics");
    }

    let service = DeliveryService::connect(config.clone())
        .await
        .context("Cannot reach the downstreams")?;

    let http_addr = config.server.socket_addr()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Cannot bind {}", http_addr))?;

    let mut running = service.start()?;
    let app = build_router(AppState::new(running.view()));

    tracing::info!("HTTP server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}/health", http_addr);
    tracing::info!("   Readiness: http://{}/ready", http_addr);
    tracing::info!("   Metrics: http://{}/metrics", http_addr);

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let outcome = tokio::select! {
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
            Ok(())
        }
        err = running.replay_failed() => {
            tracing::error!(error = %err, "Event replay failed");
            Err(err)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    tracing::info!("Shutting down gracefully...");
    running.shutdown().await?;

    outcome.context("Event replay failed")
}
