//! Process-wide cache of authenticated HTTP sessions.
//!
//! A [`Session`] wraps a [`reqwest::Client`] configured with one trust
//! context and, optionally, one client certificate. Sessions are keyed by the
//! kind of identity presented and the target host, so that every call a pod
//! makes to the same peer under the same identity reuses one connection pool.
//!
//! | Credential | Pool key |
//! |------------|----------|
//! | none | `noauth-{scheme}-{host}:{port}` (port defaults to 80/443) |
//! | account | `account-{host}:{port}` |
//! | member | `member-{host}:{port}` |
//! | service | `service-{service_id}-{host}:{port}` |
//!
//! # Trust selection
//!
//! Pods present certificates issued by the network's private root CA, so
//! hosts under the configured network domain are verified against that root
//! only. The member directory, configured proxy hosts, and anything outside
//! the network domain use the platform's built-in roots.
//!
//! Idle sessions are never pruned; [`SessionPool::close_all`] tears everything
//! down at shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use podnet::Principal;
use reqwest::{Certificate, Client, Url};
use tracing::{debug, warn};

use crate::{error::NodeError, identity::ClientCredential};

// ---------------------------------------------------------------------------
// PoolKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    NoAuth { scheme: String, host: String },
    Account { host: String },
    Member { host: String },
    Service { service_id: String, host: String },
}

impl PoolKey {
    /// Derive the key for calling `url` with `credential`.
    pub fn for_call(url: &Url, credential: Option<&ClientCredential>) -> Result<Self, NodeError> {
        let host = authority(url)?;
        let Some(credential) = credential else {
            return Ok(PoolKey::NoAuth {
                scheme: url.scheme().to_string(),
                host,
            });
        };
        match credential.principal() {
            Principal::Account { .. } => Ok(PoolKey::Account { host }),
            Principal::Member { .. } => Ok(PoolKey::Member { host }),
            Principal::Service { service_id } if !service_id.is_empty() => Ok(PoolKey::Service {
                service_id: service_id.clone(),
                host,
            }),
            Principal::Service { .. } => Err(NodeError::IdentityMismatch(
                "service credential has no service id".into(),
            )),
        }
    }

    fn host(&self) -> &str {
        match self {
            PoolKey::NoAuth { host, .. }
            | PoolKey::Account { host }
            | PoolKey::Member { host }
            | PoolKey::Service { host, .. } => host,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::NoAuth { scheme, host } => write!(f, "noauth-{scheme}-{host}"),
            PoolKey::Account { host } => write!(f, "account-{host}"),
            PoolKey::Member { host } => write!(f, "member-{host}"),
            PoolKey::Service { service_id, host } => write!(f, "service-{service_id}-{host}"),
        }
    }
}

/// `host:port`, with the scheme's default port filled in.
fn authority(url: &Url) -> Result<String, NodeError> {
    let host = url
        .host_str()
        .ok_or_else(|| NodeError::remote(url.as_str(), "URL has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| NodeError::remote(url.as_str(), "URL has no port and no default"))?;
    Ok(format!("{}:{port}", host.to_ascii_lowercase()))
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One pooled, possibly client-authenticated, HTTP client.
pub struct Session {
    key: PoolKey,
    client: Client,
    last_used: Mutex<Instant>,
}

impl Session {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The underlying client; marks the session as used.
    pub fn client(&self) -> &Client {
        *self.last_used.lock().unwrap() = Instant::now();
        &self.client
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

// ---------------------------------------------------------------------------
// TrustSettings
// ---------------------------------------------------------------------------

/// Which hosts are pods and which root they chain to.
#[derive(Clone, Default)]
pub struct TrustSettings {
    /// PEM root CA that issues pod certificates.
    pub root_ca_pem: Option<Vec<u8>>,
    /// Hosts equal to or under this domain are pods.
    pub network_domain: Option<String>,
    /// Hosts always verified against built-in roots (directory, proxies).
    pub public_hosts: Vec<String>,
    /// Applied to every session as the connect timeout.
    pub connect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trust {
    BuiltIn,
    NetworkRoot,
}

// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

pub struct SessionPool {
    sessions: RwLock<HashMap<PoolKey, Arc<Session>>>,
    root_ca: Option<Certificate>,
    network_domain: Option<String>,
    public_hosts: Vec<String>,
    connect_timeout: Option<Duration>,
}

impl SessionPool {
    pub fn new(settings: TrustSettings) -> Result<Self, NodeError> {
        let root_ca = settings
            .root_ca_pem
            .as_deref()
            .map(Certificate::from_pem)
            .transpose()
            .map_err(|e| NodeError::Tls(format!("root CA: {e}")))?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            root_ca,
            network_domain: settings.network_domain.map(|d| d.to_ascii_lowercase()),
            public_hosts: settings
                .public_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            connect_timeout: settings.connect_timeout,
        })
    }

    /// Return the pooled session for `url` under `credential`, creating it on
    /// first use.
    pub fn session(
        &self,
        url: &Url,
        credential: Option<&ClientCredential>,
    ) -> Result<Arc<Session>, NodeError> {
        let key = PoolKey::for_call(url, credential)?;

        if let Some(session) = self.sessions.read().unwrap().get(&key) {
            return Ok(Arc::clone(session));
        }

        // Built unlocked: unsealing a client key runs the passphrase KDF.
        // A racing builder for the same key loses and its client is dropped.
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let client = self.build_client(self.trust_for(&host), credential)?;
        let built = Arc::new(Session {
            key: key.clone(),
            client,
            last_used: Mutex::new(Instant::now()),
        });

        let mut sessions = self.sessions.write().unwrap();
        let session = sessions.entry(key).or_insert_with(|| {
            debug!(pool_key = %built.key, "session created");
            Arc::clone(&built)
        });
        Ok(Arc::clone(session))
    }

    /// Drop every pooled session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let n = sessions.len();
        for key in sessions.keys() {
            debug!(pool_key = %key, host = key.host(), "session closed");
        }
        sessions.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trust_for(&self, host: &str) -> Trust {
        if self.public_hosts.iter().any(|h| h == host) {
            return Trust::BuiltIn;
        }
        match &self.network_domain {
            Some(domain) if host == domain || host.ends_with(&format!(".{domain}")) => {
                Trust::NetworkRoot
            }
            _ => Trust::BuiltIn,
        }
    }

    fn build_client(
        &self,
        trust: Trust,
        credential: Option<&ClientCredential>,
    ) -> Result<Client, NodeError> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        if trust == Trust::NetworkRoot {
            match &self.root_ca {
                Some(root) => {
                    builder = builder
                        .tls_built_in_root_certs(false)
                        .add_root_certificate(root.clone());
                }
                None => warn!("no network root CA configured; verifying pod hosts against built-in roots"),
            }
        }

        if let Some(credential) = credential {
            let identity = credential
                .with_identity_pem(reqwest::Identity::from_pem)
                .map_err(|e| NodeError::IdentityMismatch(format!("cannot unseal client key: {e}")))?
                .map_err(|e| NodeError::IdentityMismatch(format!("client certificate rejected: {e}")))?;
            builder = builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| NodeError::Tls(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
