use gateway::config::{Config, DEFAULT_CONFIG_FILE};
use gateway::{ServeOutcome, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config_path = std::env::var("EXCHANGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load(&config_path)?;

    tracing::info!(config = %config_path.display(), "Starting exchange gateway");

    let server = Arc::new(Server::new(&config).await?);
    let shutdown_timeout = config.shutdown_timeout();

    let signalled = server.clone();
    let stopper = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signalled.shutdown(Instant::now() + shutdown_timeout).await
    });

    match server.run().await {
        Ok(ServeOutcome::Closed) => {
            stopper.await??;
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Server stopped unexpectedly");
            stopper.abort();
            if let Err(shutdown) = server.shutdown(Instant::now() + shutdown_timeout).await {
                tracing::error!(error = %shutdown, "Cleanup after failure was incomplete");
            }
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
