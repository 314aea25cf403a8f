use std::path::PathBuf;

use anyhow::{Context, Result};
use shared_logging::{init_tracing, TracingFormat};
use tokio::net::TcpListener;
use tracing::{info, warn};
use warden_controlplane::{
    bootstrap,
    config::{ControlPlaneConfig, SecretSource, Secrets},
    service::router,
};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => TracingFormat::Json,
        _ => TracingFormat::Pretty,
    };
    init_tracing("info,tower_http=debug", format)?;

    let config_path = std::env::var_os("WARDEN_CONFIG").map(PathBuf::from);
    let config =
        ControlPlaneConfig::load(config_path.as_deref()).context("loading configuration")?;
    let secrets = Secrets::load(&SecretSource::default()).context("loading secrets")?;
    let state = bootstrap::service_state(&config, &secrets)?;

    let listener = TcpListener::bind(config.bind.as_str())
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(addr = %config.bind, "authorization service listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving authorization api")?;
    Ok(())
}
