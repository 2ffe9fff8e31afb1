//! Shared helpers for the PodNet conformance test suite.
//!
//! Provides [`spawn_pod`], which binds a `TcpListener` on an ephemeral port
//! and serves an in-process pod backed by `MemoryStorage`, and
//! [`introduce`], which seeds every pod's directory cache with every other
//! pod so that forwarded queries can be routed and their origin assertions
//! checked.

use std::sync::Arc;

use podnet::Record;
use podnet_node::{
    build_router, storage::memory::MemoryStorage, AppState, NodeConfig, PodIdentity, SessionPool,
    Storage,
};
use podnet_node_api::{MemberInfo, NetworkLink};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use uuid::Uuid;

/// Service every test pod belongs to.
pub const SERVICE: &str = "photos";

/// Header the pods read the caller identity from.
pub const CLIENT_HEADER: &str = "x-podnet-client";

/// A running pod and handles into its internals.
pub struct TestPod {
    /// Full API base URL, e.g. `http://127.0.0.1:51234`.
    pub base_url: String,
    pub storage: Arc<MemoryStorage>,
    pub identity: Arc<PodIdentity>,
    /// The pod's outbound session pool; empty until it calls another pod.
    pub pool: Arc<SessionPool>,
}

impl TestPod {
    pub fn member_id(&self) -> Uuid {
        self.identity.member_id
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            member_id: self.member_id(),
            service_id: SERVICE.into(),
            pod_url: self.base_url.clone(),
            data_certificate: self.identity.certificate.clone(),
        }
    }

    /// Store a record owned by this pod's member, bypassing HTTP.
    pub async fn seed_record(&self, class: &str, fields: Value) -> Record {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let record = Record::new(class, self.member_id(), fields);
        self.storage.append_record(&record).await.expect("seed record");
        record
    }

    /// Add a `relation` link from this pod's member to `target`.
    pub async fn link(&self, target: &TestPod, relation: &str) {
        self.link_to(target.member_id(), relation).await;
    }

    pub async fn link_to(&self, target: Uuid, relation: &str) {
        self.storage
            .put_link(&NetworkLink {
                owner_member_id: self.member_id(),
                target_member_id: target,
                relation: relation.into(),
                created_at: chrono::Utc::now(),
            })
            .await
            .expect("seed link");
    }
}

/// Start an ephemeral in-process pod for a fresh member.
///
/// # Panics
///
/// Panics if the TCP listener cannot be bound or the pod fails to start.
pub async fn spawn_pod() -> TestPod {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("get local addr");
    let base_url = format!("http://{addr}");

    let mem_storage = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn Storage> = Arc::clone(&mem_storage) as Arc<dyn Storage>;
    let identity = Arc::new(PodIdentity::ephemeral(Uuid::now_v7(), SERVICE));

    let mut config = NodeConfig::new(base_url.clone());
    config.bind_addr = addr;
    config.member_id = Some(identity.member_id);
    config.service_id = Some(SERVICE.into());
    config.query_timeout = std::time::Duration::from_secs(3);

    let state = AppState::new(storage, config, Arc::clone(&identity), Handle::current())
        .expect("build pod state");
    let pool = Arc::clone(&state.pool);
    let router = build_router(state);

    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("conformance pod error");
    });

    TestPod {
        base_url,
        storage: mem_storage,
        identity,
        pool,
    }
}

/// Make every pod in `pods` known to every other.
pub async fn introduce(pods: &[&TestPod]) {
    for pod in pods {
        for other in pods {
            if pod.member_id() != other.member_id() {
                pod.storage
                    .put_member(&other.member_info())
                    .await
                    .expect("seed member");
            }
        }
    }
}
