/*
 * repowiki-server
 *
 * Background job engine for repository wiki generation.
 *
 * Usage:
 *   repowiki-server            # configuration from environment / .env
 *   RUST_LOG=debug repowiki-server
 *
 * Shutdown: Ctrl-C stops accepting requests, stops dispatching new jobs
 * and waits for running jobs to reach a terminal state.
 */

use anyhow::{Context, Result};
use repowiki_orchestration::{Engine, EngineConfig};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // .env before the filter reads RUST_LOG
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,repowiki_orchestration=debug,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = EngineConfig::from_env();
    let mut summary: Vec<_> = config.summary().into_iter().collect();
    summary.sort();
    tracing::info!(?summary, "configuration loaded");

    let engine = Engine::builder(config.clone())
        .build()
        .await
        .context("Failed to initialise engine")?;

    let report = engine.recover().await.context("Startup recovery failed")?;
    tracing::info!(
        interrupted = report.interrupted.len(),
        requeued = report.requeued.len(),
        "startup recovery complete"
    );

    let pool = engine.start_workers();
    let app = engine
        .router(Some(pool.handle()))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining workers");
}
