use anyhow::Result;
use axum::Router;
use files_service::{
    config::AppConfig,
    db, routes,
    services::{
        file_service::{FileService, FileServiceOptions},
        storage::BackendRegistry,
    },
};
use std::{io::ErrorKind, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting files-service with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backends and kinds ---
    let storage_config = cfg.load_storage_config()?;
    let registry = BackendRegistry::from_config(&storage_config).await?;
    for kind in registry.kinds() {
        tracing::info!("Registered kind `{}` on backend `{}`", kind.id, kind.backend);
    }

    // --- Initialize core service ---
    let service = FileService::new(
        db.clone(),
        registry,
        FileServiceOptions {
            metrics_timeout: cfg.metrics_timeout,
            stale_upload_after: cfg.stale_upload_after,
        },
    );

    if !cfg.sweep_interval.is_zero() {
        spawn_reconciliation(service.clone(), cfg.sweep_interval);
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically purge expired shares, release stale upload claims, finish
/// interrupted deletes and drop orphaned content.
fn spawn_reconciliation(service: FileService, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; give startup a full interval
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = service.reconcile().await;
            tracing::debug!(?report, "reconciliation tick");
        }
    });
}
