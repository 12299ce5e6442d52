use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    auth::PolicyGate,
    persistence::{export_snapshot, import_snapshot},
    storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting storage emulator with config: {:?}", cfg);

    // --- Initialize core service ---
    let gate = Arc::new(PolicyGate::new(cfg.auth_mode));
    let storage = StorageService::new(gate, cfg.max_upload_bytes, cfg.public_url.clone());

    if let Some(dir) = &cfg.import_dir {
        import_snapshot(&storage.objects, dir)
            .await
            .with_context(|| format!("importing snapshot from {}", dir.display()))?;
    }

    let reaper = storage.sessions.clone().spawn_reaper(cfg.session_retention);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage.clone());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();

    if let Some(dir) = &cfg.export_dir {
        export_snapshot(&storage.objects, dir)
            .await
            .with_context(|| format!("exporting snapshot to {}", dir.display()))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
