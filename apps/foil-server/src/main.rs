mod api;
mod app_state;
mod bootstrap;
mod crashguard;
mod engine;
mod facility;
mod queue;
mod responses;
mod router;
mod tasks;
#[cfg(test)]
mod test_support;
mod util;
mod worker;

use std::time::Duration;

use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    foil_otel::init();
    crashguard::install();

    let (app, _state, tasks) = bootstrap::build().await?;

    let bind = std::env::var("FOIL_BIND").unwrap_or_else(|_| "127.0.0.1:8090".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "foil-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    tracing::info!("shutting down background tasks");
    tasks.shutdown_with_grace(Duration::from_secs(5)).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
