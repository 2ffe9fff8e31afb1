//! Pod configuration, populated from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Runtime configuration for a pod.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `PODNET_BIND` | `0.0.0.0:3000` | TCP socket address to listen on |
/// | `PODNET_API_BASE` | derived from `PODNET_BIND` | Base URL advertised to other pods |
/// | `PODNET_MEMBER_ID` | from identity file | Member this pod serves (required without an identity file) |
/// | `PODNET_SERVICE_ID` | from identity file | Service the member belongs to |
/// | `PODNET_IDENTITY` | (absent = ephemeral) | Path to the sealed identity document |
/// | `PODNET_PASSPHRASE_FILE` | (absent) | File holding the identity passphrase |
/// | `PODNET_DB` | (absent = in-memory) | Path to the SQLite database file |
/// | `PODNET_ROOT_CA` | (absent) | PEM root CA for pod-to-pod TLS |
/// | `PODNET_NETWORK_DOMAIN` | (absent) | Hosts under this domain are pods |
/// | `PODNET_DIRECTORY_URL` | (absent) | Member directory service base URL |
/// | `PODNET_PROXY_HOSTS` | (empty) | Comma-separated hosts trusted via public CAs |
/// | `PODNET_QUERY_TIMEOUT_SECS` | `10` | Deadline for a whole federated query |
/// | `PODNET_FANOUT_LIMIT` | `8` | Concurrent outbound calls per query |
/// | `PODNET_MAX_DEPTH` | `3` | Largest honoured `depth` |
/// | `PODNET_DEDUP_TTL_SECS` | `300` | How long a query id stays registered |
/// | `PODNET_PURGE_INTERVAL_SECS` | `60` | Seconds between dedup sweeps |
/// | `PODNET_ASSERTION_MAX_AGE_SECS` | `300` | Accepted origin-assertion clock skew |
/// | `PODNET_CLIENT_HEADER` | `x-podnet-client` | Header carrying the TLS-verified caller |
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Socket address the server binds to.
    pub bind_addr: SocketAddr,

    /// Public base URL of this pod, e.g. `"https://0190c7a2.pods.example.net"`.
    pub api_base: String,

    /// Member and service this pod serves. Overridden by the identity file.
    pub member_id: Option<Uuid>,
    pub service_id: Option<String>,

    pub identity_path: Option<PathBuf>,
    pub passphrase_file: Option<PathBuf>,

    /// `None` means use an in-memory store (data is lost on restart).
    pub db_path: Option<String>,

    pub root_ca_path: Option<PathBuf>,
    pub network_domain: Option<String>,
    pub directory_url: Option<String>,
    pub proxy_hosts: Vec<String>,

    pub query_timeout: Duration,
    pub fanout_limit: usize,
    pub max_depth: u32,
    pub dedup_ttl: Duration,
    pub purge_interval: Duration,
    pub assertion_max_age: Duration,

    /// Lower-case header name set by the TLS terminator.
    pub client_header: String,
}

impl NodeConfig {
    /// Defaults for a pod reachable at `api_base`.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            api_base: api_base.into(),
            member_id: None,
            service_id: None,
            identity_path: None,
            passphrase_file: None,
            db_path: None,
            root_ca_path: None,
            network_domain: None,
            directory_url: None,
            proxy_hosts: Vec::new(),
            query_timeout: Duration::from_secs(10),
            fanout_limit: 8,
            max_depth: 3,
            dedup_ttl: Duration::from_secs(300),
            purge_interval: Duration::from_secs(60),
            assertion_max_age: Duration::from_secs(podnet::DEFAULT_MAX_AGE_SECS as u64),
            client_header: "x-podnet-client".into(),
        }
    }

    /// Populate config from environment variables, applying defaults where absent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr: SocketAddr = parse_or(&var, "PODNET_BIND", "0.0.0.0:3000".parse().ok())?;
        let api_base = var("PODNET_API_BASE").unwrap_or_else(|| format!("http://{bind_addr}"));

        let mut config = Self::new(api_base);
        config.bind_addr = bind_addr;
        config.member_id = parse_opt(&var, "PODNET_MEMBER_ID")?;
        config.service_id = var("PODNET_SERVICE_ID");
        config.identity_path = var("PODNET_IDENTITY").map(PathBuf::from);
        config.passphrase_file = var("PODNET_PASSPHRASE_FILE").map(PathBuf::from);
        config.db_path = var("PODNET_DB");
        config.root_ca_path = var("PODNET_ROOT_CA").map(PathBuf::from);
        config.network_domain = var("PODNET_NETWORK_DOMAIN")
            .map(|d| d.trim_start_matches('.').to_ascii_lowercase());
        config.directory_url = var("PODNET_DIRECTORY_URL").map(|u| u.trim_end_matches('/').to_string());
        config.proxy_hosts = var("PODNET_PROXY_HOSTS")
            .map(|v| {
                v.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        config.query_timeout = secs(&var, "PODNET_QUERY_TIMEOUT_SECS", config.query_timeout)?;
        config.fanout_limit = parse_or(&var, "PODNET_FANOUT_LIMIT", Some(config.fanout_limit))?;
        if config.fanout_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "PODNET_FANOUT_LIMIT",
                reason: "must be at least 1".into(),
            });
        }
        config.max_depth = parse_or(&var, "PODNET_MAX_DEPTH", Some(config.max_depth))?;
        config.dedup_ttl = secs(&var, "PODNET_DEDUP_TTL_SECS", config.dedup_ttl)?;
        config.purge_interval = secs(&var, "PODNET_PURGE_INTERVAL_SECS", config.purge_interval)?;
        config.assertion_max_age =
            secs(&var, "PODNET_ASSERTION_MAX_AGE_SECS", config.assertion_max_age)?;
        if let Some(header) = var("PODNET_CLIENT_HEADER") {
            config.client_header = header.to_ascii_lowercase();
        }

        if config.identity_path.is_none() && config.member_id.is_none() {
            return Err(ConfigError::Missing("PODNET_MEMBER_ID or PODNET_IDENTITY"));
        }
        Ok(config)
    }

    /// Read the identity passphrase from `passphrase_file`, trimming the
    /// trailing newline.
    pub fn read_passphrase(&self) -> Result<String, ConfigError> {
        let path = self
            .passphrase_file
            .as_ref()
            .ok_or(ConfigError::Missing("PODNET_PASSPHRASE_FILE"))?;
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
            var: "PODNET_PASSPHRASE_FILE",
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Ok(raw.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn parse_opt<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|v| {
            v.parse::<T>().map_err(|e| ConfigError::Invalid {
                var: name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match parse_opt(var, name)? {
        Some(v) => Ok(v),
        None => default.ok_or(ConfigError::Missing(name)),
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(var, name, Some(default.as_secs())).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_with_member_id() {
        let id = Uuid::now_v7();
        let id_str = id.to_string();
        let config = NodeConfig::from_lookup(lookup(&[("PODNET_MEMBER_ID", id_str.as_str())])).unwrap();
        assert_eq!(config.member_id, Some(id));
        assert_eq!(config.api_base, "http://0.0.0.0:3000");
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.client_header, "x-podnet-client");
        assert_eq!(config.assertion_max_age, Duration::from_secs(300));
    }

    #[test]
    fn lists_and_domains_are_normalised() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("PODNET_IDENTITY", "/etc/podnet/identity.json"),
            ("PODNET_PROXY_HOSTS", "Proxy.Example.com, ,cdn.example.com"),
            ("PODNET_NETWORK_DOMAIN", ".Pods.Example.net"),
            ("PODNET_DIRECTORY_URL", "https://dir.example.net/"),
        ]))
        .unwrap();
        assert_eq!(config.proxy_hosts, vec!["proxy.example.com", "cdn.example.com"]);
        assert_eq!(config.network_domain.as_deref(), Some("pods.example.net"));
        assert_eq!(config.directory_url.as_deref(), Some("https://dir.example.net"));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = NodeConfig::from_lookup(lookup(&[("PODNET_MEMBER_ID", "not-a-uuid")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PODNET_MEMBER_ID", .. }));

        let id_str = Uuid::now_v7().to_string();
        let err = NodeConfig::from_lookup(lookup(&[
            ("PODNET_MEMBER_ID", id_str.as_str()),
            ("PODNET_FANOUT_LIMIT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PODNET_FANOUT_LIMIT", .. }));
    }

    #[test]
    fn member_or_identity_is_required() {
        assert!(matches!(
            NodeConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(_))
        ));
    }
}
