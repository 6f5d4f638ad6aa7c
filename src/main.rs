use anyhow::{Context, Result};
use axum::Router;
use derma_inference::{
    config::{AppConfig, StorageBackend},
    routes,
    services::{
        blob_store::{BlobStore, FsBlobStore, HttpBlobStore},
        fetcher::BlobFetcher,
        model_loader,
        pipeline::EventPipeline,
        result_store::SqliteResultStore,
    },
    state::AppState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting derma-inference with config: {:?}", redacted(&cfg));

    // --- Ensure scratch directory exists ---
    if !cfg.scratch_dir.exists() {
        fs::create_dir_all(&cfg.scratch_dir)?;
        tracing::info!("Created scratch directory at {}", cfg.scratch_dir.display());
    }

    // --- Initialize result store ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let connect_options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(cfg.request_timeout)
            .connect_with(connect_options)
            .await?,
    );
    let results = SqliteResultStore::new(db);
    results.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object storage ---
    let store: Arc<dyn BlobStore> = match cfg.storage_backend {
        StorageBackend::Fs => {
            tracing::info!("Reading objects from {}", cfg.storage_dir.display());
            Arc::new(FsBlobStore::new(&cfg.storage_dir))
        }
        StorageBackend::Http => {
            tracing::info!("Reading objects from {}", cfg.storage_endpoint);
            Arc::new(HttpBlobStore::new(
                &cfg.storage_endpoint,
                cfg.storage_token.clone(),
                cfg.request_timeout,
            )?)
        }
    };
    let fetcher = BlobFetcher::new(store, cfg.scratch_dir.clone());

    // --- Load the model; no model, no server ---
    let model = model_loader::load_model(&fetcher, &cfg.model_artifacts())
        .await
        .context("loading model at startup")?;

    // --- Build router ---
    let results = Arc::new(results);
    let pipeline = EventPipeline::new(fetcher, Arc::new(model), results.clone(), cfg.event_type.clone());
    let state = AppState {
        pipeline: Arc::new(pipeline),
        results,
        scratch_dir: cfg.scratch_dir.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

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

    Ok(())
}

/// Config as logged at startup, without the storage token.
fn redacted(cfg: &AppConfig) -> AppConfig {
    let mut cfg = cfg.clone();
    if cfg.storage_token.is_some() {
        cfg.storage_token = Some("<redacted>".into());
    }
    cfg
}

/// Resolves on Ctrl-C or SIGTERM (the hosting platform's stop signal).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
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
    tracing::info!("Shutdown signal received, draining connections");
}
