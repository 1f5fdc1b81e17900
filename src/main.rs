use anyhow::Result;
use fotolio_ws::{config::AppConfig, create_app_router, state::AppState};
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; fail silently otherwise.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env()?;
    let port = config.port;

    let app_state = Arc::new(AppState::new(config).await?);
    info!("🚀 Application state initialized");

    // Settlement/cleanup queue consumer as a background task
    let worker_state = app_state.clone();
    tokio::spawn(async move {
        fotolio_ws::services::start_queue_worker(worker_state).await;
    });
    info!("🔄 Queue worker started (settlement + retention jobs)");

    // Scheduled producers (expiry sweep, intent expiry, retention enqueue)
    fotolio_ws::services::init_scheduled_jobs(app_state.clone()).await?;
    info!("⏰ Scheduled jobs service started");

    let app = create_app_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("✅ Server shutdown completed");

    Ok(())
}
