//! `podnet-node` — a PodNet pod.
//!
//! # Quick start
//!
//! ```sh
//! # Ephemeral in-memory pod for one member:
//! PODNET_MEMBER_ID=0190c7a2-... PODNET_SERVICE_ID=photos podnet-node
//!
//! # Persistent pod with a sealed identity:
//! PODNET_IDENTITY=/etc/podnet/identity.json \
//! PODNET_PASSPHRASE_FILE=/run/secrets/podnet \
//! PODNET_DB=./pod.db podnet-node
//! ```
//!
//! # Environment variables
//!
//! See [`NodeConfig`] for the full list.

use std::sync::Arc;

use podnet_node::{
    build_router,
    dedup::run_purge_loop,
    storage::{memory::MemoryStorage, sqlite::SqliteStorage, Storage},
    AppState, NodeConfig, PodIdentity,
};
use tokio::runtime::Handle;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podnet_node=info,tower_http=debug".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_env()?;

    let identity = match &config.identity_path {
        Some(path) => {
            let passphrase = config.read_passphrase()?;
            let identity = PodIdentity::load(path, &passphrase)?;
            tracing::info!("identity: loaded {} from {}", identity.principal(), path.display());
            identity
        }
        None => {
            let member_id = config
                .member_id
                .ok_or("PODNET_MEMBER_ID must be set without an identity file")?;
            let service_id = config.service_id.clone().unwrap_or_else(|| "default".into());
            tracing::warn!("identity: ephemeral Data key for {member_id}; assertions will not survive restart");
            PodIdentity::ephemeral(member_id, service_id)
        }
    };

    let storage: Arc<dyn Storage> = match &config.db_path {
        Some(path) => {
            tracing::info!("storage: SQLite at {path}");
            Arc::new(SqliteStorage::open(path)?)
        }
        None => {
            tracing::info!("storage: in-memory (data will not survive restart)");
            Arc::new(MemoryStorage::new())
        }
    };

    let state = AppState::new(storage, config.clone(), Arc::new(identity), Handle::current())?;
    let pool = Arc::clone(&state.pool);

    let purge = tokio::spawn(run_purge_loop(state.dedup(), config.purge_interval));
    tracing::info!(
        "dedup: purge loop starting (interval = {}s, ttl = {}s)",
        config.purge_interval.as_secs(),
        config.dedup_ttl.as_secs()
    );

    let app = build_router(state);
    tracing::info!("listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purge.abort();
    let closed = pool.close_all();
    tracing::info!("shutdown: closed {closed} pooled sessions");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown: signal received");
}
