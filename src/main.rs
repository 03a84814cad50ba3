use clap::Parser;
use helmet_api::config::Config;
use helmet_api::http::{self, AppState};
use helmet_api::InferenceService;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .with_target(false)
        .init();

    info!("🚀 Starting {} v{}", http::SERVICE_TITLE, env!("CARGO_PKG_VERSION"));

    // 1. Load the model; refuse to serve without it
    info!("Loading model from {}...", config.model.display());
    let service = InferenceService::load(
        &config.model,
        config.device,
        config.intra_threads,
        config.inference_limits(),
    )
    .inspect_err(|e| error!("❌ Model load failed: {e}"))?;
    info!("✅ Model loaded on {}", service.device());

    // 2. Router
    let app = http::router(AppState::ready(service), config.max_upload_bytes);

    // 3. Serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
