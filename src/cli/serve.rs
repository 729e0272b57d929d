use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::server::{AppState, create_router};
use crate::store::{SqliteStore, Store};

pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

/// Config file first, then flag overrides.
pub fn resolve_config(options: &ServeOptions) -> anyhow::Result<ServerConfig> {
    let mut config = match &options.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = &options.host {
        config.host = host.clone();
    }
    if let Some(port) = options.port {
        config.port = port;
    }
    if let Some(data_dir) = &options.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

pub async fn run_serve(options: ServeOptions) -> anyhow::Result<()> {
    let config = resolve_config(&options)?;

    let db_path = config.db_path();
    if !db_path.exists() {
        bail!(
            "Database not found at {}. Run 'berth admin init' first.",
            db_path.display()
        );
    }
    let store = SqliteStore::new(&db_path)?;
    store.initialize()?;
    store.seed_permissions()?;
    if !store.has_admin_user()? {
        bail!("Server not initialized. Run 'berth admin init' first to create an admin user.");
    }

    let secrets = config
        .secret_box()
        .context("failed to load the server token encryption key")?;
    let addr = config.socket_addr()?;
    let cancel = CancellationToken::new();
    let state = Arc::new(AppState::new(
        Arc::new(store),
        config,
        secrets,
        cancel.clone(),
    )?);

    let replayed = state.queue.replay().await?;
    if replayed > 0 {
        info!(replayed, "resubmitted queued operations");
    }
    state.queue.start_reaper();

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting server on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
    })
    .await?;

    state.queue.shutdown().await;
    info!("server stopped");
    Ok(())
}
