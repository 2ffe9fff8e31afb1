//! HTTP request handlers for the pod endpoints.
//!
//! Each submodule covers one group of endpoints listed in
//! `podnet-node-api`. Handlers are async functions that receive Axum
//! extractors and return `Result<impl IntoResponse, AppError>`; the work
//! itself lives in the federator, keyring, and directory held by
//! [`AppState`].

pub mod content;
pub mod links;
pub mod members;
pub mod node;
pub mod query;

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::{
    config::NodeConfig,
    dedup::QueryDedupCache,
    directory::MemberDirectory,
    error::NodeError,
    federation::{FederationSettings, QueryFederator},
    gateway::ApiGateway,
    identity::PodIdentity,
    keyring::ContentKeyring,
    session_pool::{SessionPool, TrustSettings},
    storage::Storage,
};

/// Shared application state threaded through all Axum handlers via
/// [`axum::extract::State`].
///
/// Built once by [`AppState::new`]; the session pool it owns is torn down
/// with [`SessionPool::close_all`] at shutdown.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub config: NodeConfig,
    pub identity: Arc<PodIdentity>,
    pub pool: Arc<SessionPool>,
    pub gateway: ApiGateway,
    pub federator: QueryFederator,
    pub keyring: ContentKeyring,
    pub directory: MemberDirectory,
}

impl AppState {
    /// Wire the federation layer together. `runtime` drives blocking gateway
    /// calls.
    pub fn new(
        storage: Arc<dyn Storage>,
        config: NodeConfig,
        identity: Arc<PodIdentity>,
        runtime: Handle,
    ) -> Result<Self, NodeError> {
        let pool = Arc::new(SessionPool::new(trust_settings(&config)?)?);
        let gateway = ApiGateway::new(Arc::clone(&pool), runtime);
        let directory = MemberDirectory::new(
            Arc::clone(&storage),
            gateway.clone(),
            Arc::clone(&identity),
            config.directory_url.clone(),
        );
        let federator = QueryFederator::new(
            Arc::clone(&storage),
            QueryDedupCache::new(Arc::clone(&storage), config.dedup_ttl),
            directory.clone(),
            gateway.clone(),
            Arc::clone(&identity),
            FederationSettings::from(&config),
        );
        let keyring = ContentKeyring::new(Arc::clone(&storage), identity.member_id);
        Ok(Self {
            storage,
            config,
            identity,
            pool,
            gateway,
            federator,
            keyring,
            directory,
        })
    }

    pub fn dedup(&self) -> QueryDedupCache {
        QueryDedupCache::new(Arc::clone(&self.storage), self.config.dedup_ttl)
    }
}

/// Trust roots for outbound sessions. The directory host is always
/// verified against the built-in roots.
fn trust_settings(config: &NodeConfig) -> Result<TrustSettings, NodeError> {
    let root_ca_pem = config
        .root_ca_path
        .as_ref()
        .map(|path| {
            std::fs::read(path)
                .map_err(|e| NodeError::Tls(format!("cannot read {}: {e}", path.display())))
        })
        .transpose()?;
    let mut public_hosts = config.proxy_hosts.clone();
    if let Some(host) = config
        .directory_url
        .as_deref()
        .and_then(|url| reqwest::Url::parse(url).ok())
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
    {
        public_hosts.push(host);
    }
    Ok(TrustSettings {
        root_ca_pem,
        network_domain: config.network_domain.clone(),
        public_hosts,
        connect_timeout: Some(config.query_timeout),
    })
}
