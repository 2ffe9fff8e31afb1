//! `podctl` — PodNet operator command-line interface.
//!
//! - **`identity new`** — seal a TLS key and a fresh Data key into an
//!   identity document.
//! - **`query`** — run a federated query against a pod and print the result.
//! - **`content-url`** — derive the tokenised query string for a CDN asset.
//! - **`verify-token`** — check a tokenised query string, offline with the
//!   key or online against a pod.
//!
//! Network calls go through the same gateway a pod uses, in its blocking
//! form.

use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use podnet::{
    Comparator, ContentKey, ContentTokenParams, FilterSet, Identity, Principal, RecursiveQuery,
};
use podnet_node::{ApiGateway, ApiRequest, ClientCredential, SessionPool, TrustSettings};
use podnet_node_api::{QueryRequest, QueryResponse, TokenRequest, TokenResponse};
use serde_json::Value;
use uuid::Uuid;

/// podctl — PodNet operator CLI
#[derive(Parser)]
#[command(name = "podctl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage identity documents.
    #[command(subcommand)]
    Identity(IdentityCommand),

    /// Run a federated query against a pod.
    ///
    /// Examples:
    ///   podctl query --pod https://a.pods.example.net --class photo \
    ///     --depth 1 --relation friend --filter album:eq:trips
    Query {
        /// Base URL of the pod to ask.
        #[arg(long, env = "PODCTL_POD")]
        pod: String,

        /// Record class to query.
        #[arg(long)]
        class: String,

        /// Hops to follow beyond the first pod.
        #[arg(long, default_value_t = 0)]
        depth: u32,

        /// Relation to follow. Repeat for several.
        #[arg(long = "relation", value_name = "LABEL")]
        relations: Vec<String>,

        /// Forward to exactly this member instead of following relations.
        #[arg(long, value_name = "UUID")]
        remote_member: Option<Uuid>,

        /// Filter as <field>:<comparator>:<value>. The value is read as JSON
        /// when it parses, otherwise as a string. Repeat for several.
        #[arg(long = "filter", value_name = "FIELD:CMP:VALUE")]
        filters: Vec<String>,

        /// Field to return. Repeat for several; none returns all.
        #[arg(long = "field", value_name = "NAME")]
        fields: Vec<String>,

        #[arg(long)]
        first: Option<u32>,

        #[arg(long, value_name = "UUID")]
        after: Option<Uuid>,

        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Print the tokenised query string for a CDN asset.
    ContentUrl {
        #[command(flatten)]
        key: KeyArgs,

        #[arg(long)]
        service: String,

        #[arg(long, value_name = "UUID")]
        member: Uuid,

        #[arg(long)]
        asset: String,
    },

    /// Check a tokenised query string produced by `content-url` or a pod.
    ///
    /// With --key the check is local; with --pod it is sent to the pod's
    /// verify endpoint.
    VerifyToken {
        /// The query string, with or without a leading `?`.
        query: String,

        #[arg(long, conflicts_with = "key")]
        pod: Option<String>,

        #[arg(long, requires = "key_id")]
        key: Option<String>,

        #[arg(long)]
        key_id: Option<u32>,

        #[command(flatten)]
        auth: AuthArgs,
    },
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Provision a sealed identity document.
    ///
    /// Example:
    ///   podctl identity new --principal member:0190c7a2-...@photos \
    ///     --cert pod.pem --key pod-key.pem --passphrase-file pass --out identity.json
    New {
        /// member:<uuid>@<service> | account:<uuid> | service:<id>
        #[arg(long)]
        principal: String,

        /// PEM certificate chain issued for the principal.
        #[arg(long)]
        cert: PathBuf,

        /// PEM private key matching --cert.
        #[arg(long)]
        key: PathBuf,

        #[arg(long)]
        passphrase_file: PathBuf,

        /// Where to write the identity document; stdout when absent.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct AuthArgs {
    /// Identity document to present for mutual TLS.
    #[arg(long, env = "PODCTL_IDENTITY", requires = "passphrase_file")]
    identity: Option<PathBuf>,

    #[arg(long, env = "PODCTL_PASSPHRASE_FILE")]
    passphrase_file: Option<PathBuf>,

    /// Principal to name in the client header when no TLS terminator sets it
    /// (development pods).
    #[arg(long, value_name = "PRINCIPAL")]
    caller: Option<String>,

    #[arg(long, default_value = "x-podnet-client")]
    client_header: String,

    /// PEM root CA for pod hosts.
    #[arg(long, env = "PODCTL_ROOT_CA")]
    root_ca: Option<PathBuf>,

    #[arg(long, env = "PODCTL_NETWORK_DOMAIN")]
    network_domain: Option<String>,
}

#[derive(clap::Args)]
struct KeyArgs {
    /// The content key secret.
    #[arg(long)]
    key: String,

    #[arg(long)]
    key_id: u32,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Identity(IdentityCommand::New {
            principal,
            cert,
            key,
            passphrase_file,
            out,
        }) => {
            let principal = Principal::from_header_value(&principal).unwrap_or_else(|e| fatal(&e));
            let cert_pem = read(&cert);
            let key_pem = fs::read(&key)
                .unwrap_or_else(|e| fatal(&format!("failed to read {}: {e}", key.display())));
            let passphrase = read_passphrase(&passphrase_file);
            let identity = Identity::provision(principal, cert_pem, &key_pem, &passphrase)
                .unwrap_or_else(|e| fatal(&e));
            let json = identity.to_json().unwrap_or_else(|e| fatal(&e));
            match out {
                Some(path) => {
                    fs::write(&path, json).unwrap_or_else(|e| {
                        fatal(&format!("failed to write {}: {e}", path.display()))
                    });
                    eprintln!(
                        "wrote {} (data certificate {})",
                        path.display(),
                        identity.data.certificate.public_key
                    );
                }
                None => println!("{json}"),
            }
        }

        Command::Query {
            pod,
            class,
            depth,
            relations,
            remote_member,
            filters,
            fields,
            first,
            after,
            auth,
        } => {
            let mut query = RecursiveQuery::new(class);
            query.depth = depth;
            query.relations = relations;
            query.remote_member_id = remote_member;
            query.filters = parse_filters(&filters).unwrap_or_else(|e| fatal(&e));
            query.fields = fields;
            query.first = first;
            query.after = after;
            if let Err(e) = query.validate() {
                fatal(&e);
            }

            let request = ApiRequest::post("{pod}/v1/classes/{class}/query")
                .context("pod", pod.trim_end_matches('/'))
                .context("class", query.class_name.clone())
                .json(&QueryRequest::new(query));
            let response = call(request, &auth);
            let result: QueryResponse = response.json().unwrap_or_else(|e| fatal(&e));
            println!(
                "{}",
                serde_json::to_string_pretty(&result).unwrap_or_else(|e| fatal(&e))
            );
        }

        Command::ContentUrl {
            key,
            service,
            member,
            asset,
        } => {
            let key = content_key(key.key, key.key_id);
            println!("{}", key.generate_url_query_parameters(&service, member, &asset));
        }

        Command::VerifyToken {
            query,
            pod,
            key,
            key_id,
            auth,
        } => {
            let params = ContentTokenParams::parse(&query).unwrap_or_else(|e| fatal(&e));
            match (key, pod) {
                (Some(secret), _) => {
                    let key_id = key_id.unwrap_or(params.key_id);
                    if key_id != params.key_id {
                        fatal(&format!("token was issued with key {}", params.key_id));
                    }
                    content_key(secret, key_id)
                        .verify_token(
                            &params.service_id,
                            params.member_id,
                            &params.asset_id,
                            &params.content_token,
                            Utc::now(),
                        )
                        .unwrap_or_else(|e| fatal(&e));
                    println!("valid");
                }
                (None, Some(pod)) => {
                    let request = ApiRequest::post("{pod}/v1/content/verify")
                        .context("pod", pod.trim_end_matches('/'))
                        .header("authorization", &format!("Bearer {}", params.content_token))
                        .json(&TokenRequest {
                            service_id: params.service_id.clone(),
                            asset_id: params.asset_id.clone(),
                            member_id: params.member_id,
                            key_id: Some(params.key_id),
                        });
                    let response = call(request, &auth);
                    let verified: TokenResponse = response.json().unwrap_or_else(|e| fatal(&e));
                    println!("valid (key {})", verified.key_id);
                }
                (None, None) => fatal(&"pass --key for a local check or --pod to ask a pod"),
            }
        }
    }
}

/// Parse `field:comparator:value` arguments.
fn parse_filters(raw: &[String]) -> Result<FilterSet, String> {
    raw.iter().try_fold(FilterSet::new(), |set, arg| {
        let mut parts = arg.splitn(3, ':');
        let (Some(field), Some(cmp), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("invalid --filter {arg:?}: expected <field>:<comparator>:<value>"));
        };
        let comparator = cmp
            .parse::<Comparator>()
            .map_err(|_| format!("invalid --filter {arg:?}: unknown comparator {cmp:?}"))?;
        let operand =
            serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.into()));
        Ok(set.with(field, comparator, operand))
    })
}

fn content_key(key: String, key_id: u32) -> ContentKey {
    ContentKey {
        member_id: Uuid::nil(),
        key_id,
        key,
        not_before: chrono::DateTime::<Utc>::MIN_UTC,
        not_after: None,
    }
}

/// Make one blocking call through a fresh gateway.
fn call(request: ApiRequest, auth: &AuthArgs) -> podnet_node::ApiResponse {
    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| fatal(&format!("failed to start runtime: {e}")));
    let pool = SessionPool::new(TrustSettings {
        root_ca_pem: auth.root_ca.as_ref().map(|path| {
            fs::read(path)
                .unwrap_or_else(|e| fatal(&format!("failed to read {}: {e}", path.display())))
        }),
        network_domain: auth.network_domain.clone(),
        ..TrustSettings::default()
    })
    .unwrap_or_else(|e| fatal(&e));
    let gateway = ApiGateway::new(Arc::new(pool), runtime.handle().clone());

    let credential = auth.identity.as_ref().map(|path| {
        let identity = Identity::from_json(&read(path)).unwrap_or_else(|e| fatal(&e));
        let passphrase = auth
            .passphrase_file
            .as_ref()
            .map(read_passphrase)
            .unwrap_or_default();
        ClientCredential::new(identity.principal, identity.tls, passphrase)
    });

    let request = match &auth.caller {
        Some(caller) => request.header(&auth.client_header, caller),
        None => request,
    };
    gateway
        .call_blocking(request, credential.as_ref())
        .unwrap_or_else(|e| fatal(&e))
}

fn read(path: &PathBuf) -> String {
    fs::read_to_string(path)
        .unwrap_or_else(|e| fatal(&format!("failed to read {}: {e}", path.display())))
}

fn read_passphrase(path: &PathBuf) -> String {
    read(path).trim_end_matches(['\r', '\n']).to_string()
}

/// Print an error message to stderr and exit with code 2.
fn fatal(msg: &dyn std::fmt::Display) -> ! {
    eprintln!("podctl: {msg}");
    process::exit(2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_parse_json_or_string() {
        let set = parse_filters(&[
            "album:eq:trips".to_string(),
            "rating:after:3".to_string(),
            "taken:atbefore:2026-03-01T10:00:00Z".to_string(),
        ])
        .unwrap();
        let expected = FilterSet::new()
            .with("album", Comparator::Eq, json!("trips"))
            .with("rating", Comparator::After, json!(3))
            .with("taken", Comparator::AtBefore, json!("2026-03-01T10:00:00Z"));
        assert_eq!(set, expected);
    }

    #[test]
    fn bad_filters_are_reported() {
        assert!(parse_filters(&["album:eq".to_string()]).is_err());
        assert!(parse_filters(&["album:like:x".to_string()]).is_err());
    }

    #[test]
    fn offline_url_verifies_with_same_key() {
        let member = Uuid::now_v7();
        let query = content_key("s3cret".into(), 4).generate_url_query_parameters(
            "photos",
            member,
            "album/1.jpg",
        );
        let params = ContentTokenParams::parse(&query).unwrap();
        assert_eq!(params.key_id, 4);
        content_key("s3cret".into(), 4)
            .verify_token(
                &params.service_id,
                params.member_id,
                &params.asset_id,
                &params.content_token,
                Utc::now(),
            )
            .unwrap();
    }
}
