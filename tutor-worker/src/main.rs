use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tutor_worker::{Backends, HttpModelClient, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = WorkerSettings::from_env().context("loading worker settings")?;
    tutor_queue::observability::init_tracing(settings.log_json);

    let backends = match Backends::connect(&settings).await {
        Ok(backends) => backends,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Backing store unreachable at startup");
            return Err(e);
        }
    };

    let model = HttpModelClient::new(settings.model_endpoint.clone(), settings.model_timeout)
        .context("building model client")?;

    tutor_worker::run(&settings, backends, Arc::new(model), shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
