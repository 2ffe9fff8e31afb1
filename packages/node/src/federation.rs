//! Recursive query federation.
//!
//! [`QueryFederator::execute`] answers one `POST /v1/classes/{class}/query`:
//!
//! 1. Validate the query and compile its filters. Malformed input fails
//!    before anything is registered or sent.
//! 2. Establish trust. A forwarded query carries an origin assertion, which
//!    must verify against the origin member's Data certificate over exactly
//!    the scope this hop received. A fresh query needs a caller identity from
//!    the TLS terminator instead.
//! 3. Register the `query_id`; a second arrival is refused with
//!    [`NodeError::DuplicateQuery`]. This is what breaks cycles.
//! 4. Run the query against local records.
//! 5. If the query still has depth and something to follow, send it with
//!    one less hop to every target: the `remote_member_id`, or each linked
//!    member whose relation is listed. Calls run concurrently, at most
//!    `fanout_limit` at a time, and share the deadline set at the entry pod.
//!    That deadline is never later than `query_timeout` from its arrival.
//! 6. Merge. Remote items are appended after local ones, skipping ids already
//!    present. Targets that fail are logged and left out.
//!
//! An assertion is minted only when this pod is the entry point and fans
//! out; a received assertion is forwarded unchanged.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podnet::{AssertedScope, OriginAssertion, Principal, Record, RecursiveQuery};
use podnet_node_api::{PageInfo, QueryRequest, QueryResponse};
use tokio::{sync::Semaphore, task::JoinSet};
use uuid::Uuid;

use crate::{
    config::NodeConfig,
    dedup::QueryDedupCache,
    directory::MemberDirectory,
    error::NodeError,
    gateway::{ApiGateway, ApiRequest},
    identity::PodIdentity,
    storage::Storage,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Limits applied to every federated query.
#[derive(Debug, Clone)]
pub struct FederationSettings {
    pub max_depth: u32,
    pub fanout_limit: usize,
    pub query_timeout: Duration,
    pub assertion_max_age: Duration,
    /// Header naming this pod as the caller on outbound calls.
    pub client_header: String,
}

impl From<&NodeConfig> for FederationSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            fanout_limit: config.fanout_limit.max(1),
            query_timeout: config.query_timeout,
            assertion_max_age: config.assertion_max_age,
            client_header: config.client_header.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// QueryFederator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QueryFederator {
    storage: Arc<dyn Storage>,
    dedup: QueryDedupCache,
    directory: MemberDirectory,
    gateway: ApiGateway,
    identity: Arc<PodIdentity>,
    settings: FederationSettings,
}

impl QueryFederator {
    pub fn new(
        storage: Arc<dyn Storage>,
        dedup: QueryDedupCache,
        directory: MemberDirectory,
        gateway: ApiGateway,
        identity: Arc<PodIdentity>,
        settings: FederationSettings,
    ) -> Self {
        Self {
            storage,
            dedup,
            directory,
            gateway,
            identity,
            settings,
        }
    }

    /// Answer `request` with local results plus whatever the fan-out returns.
    ///
    /// `caller` is the transport identity verified by the TLS terminator.
    pub async fn execute(
        &self,
        request: QueryRequest,
        caller: Option<&Principal>,
    ) -> Result<QueryResponse, NodeError> {
        let now = Utc::now();
        let predicates = request.query.validate()?;
        let supplied = request.assertion().map_err(|field| {
            NodeError::FilterMalformed(format!("origin assertion is missing {field}"))
        })?;

        let origin = match (&supplied, caller) {
            (Some(assertion), _) => {
                self.verify_assertion(assertion, &request.query, now).await?;
                format!("origin:{}", assertion.origin_member_id)
            }
            (None, Some(principal)) => principal.to_header_value(),
            (None, None) => return Err(NodeError::IdentityRequired),
        };

        let mut query = request.query;
        if !self.dedup.set(query.query_id, &origin).await? {
            return Err(NodeError::DuplicateQuery(query.query_id));
        }
        query.depth = query.depth.min(self.settings.max_depth);

        let local = match self.storage.query_records(&query, &predicates).await {
            Ok(page) => page,
            Err(e) => {
                // Let the caller retry the same id.
                let _ = self.dedup.delete(query.query_id).await;
                return Err(e.into());
            }
        };
        tracing::debug!(
            "query {}: {} local matches (depth {}, origin {origin})",
            query.query_id,
            local.total_count,
            query.depth
        );

        let end_cursor = local.items.last().map(|r| r.id);
        let page_info = PageInfo {
            end_cursor,
            has_next_page: local.has_next_page,
        };
        let mut response = QueryResponse {
            items: local.items,
            total_count: local.total_count,
            page_info,
        };

        if query.fans_out() {
            let latest = chrono::Duration::from_std(self.settings.query_timeout)
                .ok()
                .and_then(|timeout| now.checked_add_signed(timeout))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            // A supplied deadline may shorten the walk, never extend it.
            let deadline = query.deadline.map_or(latest, |d| d.min(latest));
            let remote = self.fan_out(&query, supplied, deadline).await?;
            merge(&mut response, remote);
        }
        Ok(response)
    }

    async fn verify_assertion(
        &self,
        assertion: &OriginAssertion,
        query: &RecursiveQuery,
        now: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        let certificate = if assertion.origin_member_id == self.identity.member_id {
            self.identity.certificate.clone()
        } else {
            self.directory
                .resolve(assertion.origin_member_id)
                .await?
                .data_certificate
        };
        let max_age = chrono::Duration::from_std(self.settings.assertion_max_age)
            .unwrap_or(chrono::Duration::MAX);
        assertion.verify(&certificate, self.scope(query), now, max_age)?;
        Ok(())
    }

    fn scope<'a>(&'a self, query: &'a RecursiveQuery) -> AssertedScope<'a> {
        AssertedScope {
            service_id: &self.identity.service_id,
            relations: &query.relations,
            filters: &query.filters,
        }
    }

    /// Members the query should be forwarded to, in link order.
    pub async fn targets(&self, query: &RecursiveQuery) -> Result<Vec<Uuid>, NodeError> {
        if let Some(member_id) = query.remote_member_id {
            // Arrived at the named member: nothing further to forward.
            if member_id == self.identity.member_id {
                return Ok(Vec::new());
            }
            return Ok(vec![member_id]);
        }
        let links = self.storage.list_links(self.identity.member_id).await?;
        let mut seen = HashSet::new();
        Ok(links
            .into_iter()
            .filter(|link| query.relations.contains(&link.relation))
            .map(|link| link.target_member_id)
            .filter(|id| *id != self.identity.member_id && seen.insert(*id))
            .collect())
    }

    async fn fan_out(
        &self,
        query: &RecursiveQuery,
        supplied: Option<OriginAssertion>,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Record>, NodeError> {
        let targets = self.targets(query).await?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let Ok(remaining) = (deadline - Utc::now()).to_std() else {
            tracing::warn!("query {}: deadline passed, not forwarding", query.query_id);
            return Ok(Vec::new());
        };

        let assertion = match supplied {
            Some(assertion) => assertion,
            None => OriginAssertion::mint(
                self.identity.signing_key(),
                self.identity.member_id,
                self.scope(query),
                Utc::now(),
            )?,
        };
        let mut next = query.forwarded();
        next.deadline = Some(deadline);
        let body = QueryRequest::forwarded(next, &assertion);

        let semaphore = Arc::new(Semaphore::new(self.settings.fanout_limit));
        let mut join_set = JoinSet::new();
        for (index, target) in targets.iter().copied().enumerate() {
            let this = self.clone();
            let body = body.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let closed = NodeError::remote(target.to_string(), "fan-out closed");
                    return (index, target, Err(closed));
                };
                (index, target, this.forward(target, body, remaining).await)
            });
        }

        let mut results: Vec<Option<Vec<Record>>> = vec![None; targets.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, _, Ok(items))) => results[index] = Some(items),
                Ok((_, target, Err(e))) => {
                    tracing::warn!("query {}: skipping {target}: {e}", query.query_id);
                }
                Err(e) => tracing::warn!("query {}: fan-out task failed: {e}", query.query_id),
            }
        }
        Ok(results.into_iter().flatten().flatten().collect())
    }

    async fn forward(
        &self,
        target: Uuid,
        body: QueryRequest,
        timeout: Duration,
    ) -> Result<Vec<Record>, NodeError> {
        let member = self.directory.resolve(target).await?;
        let request = ApiRequest::post("{pod}/v1/classes/{class}/query")
            .context("pod", member.pod_url.trim_end_matches('/'))
            .context("class", urlencoding::encode(&body.query.class_name).into_owned())
            .header(
                &self.settings.client_header,
                &self.identity.principal().to_header_value(),
            )
            .json(&body)
            .timeout(timeout);
        let response = self
            .gateway
            .call(request, self.identity.client.as_ref())
            .await?;
        let answer: QueryResponse = response.json()?;
        Ok(answer.items)
    }
}

/// Append `remote` to `response`, skipping ids already present.
fn merge(response: &mut QueryResponse, remote: Vec<Record>) {
    let mut seen: HashSet<Uuid> = response.items.iter().map(|r| r.id).collect();
    for record in remote {
        if seen.insert(record.id) {
            response.items.push(record);
            response.total_count += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session_pool::{SessionPool, TrustSettings},
        storage::memory::MemoryStorage,
    };
    use podnet::{Comparator, FilterSet};
    use axum::{routing::post, Json, Router};
    use podnet_node_api::{MemberInfo, NetworkLink};
    use serde_json::{json, Map, Value};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::runtime::Handle;

    struct Pod {
        federator: QueryFederator,
        storage: Arc<dyn Storage>,
        identity: Arc<PodIdentity>,
        pool: Arc<SessionPool>,
    }

    fn pod() -> Pod {
        pod_with(|_| {})
    }

    fn pod_with(configure: impl FnOnce(&mut NodeConfig)) -> Pod {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let identity = Arc::new(PodIdentity::ephemeral(Uuid::now_v7(), "photos"));
        let pool = Arc::new(SessionPool::new(TrustSettings::default()).unwrap());
        let gateway = ApiGateway::new(Arc::clone(&pool), Handle::current());
        let directory = MemberDirectory::new(
            Arc::clone(&storage),
            gateway.clone(),
            Arc::clone(&identity),
            None,
        );
        let mut config = NodeConfig::new("http://127.0.0.1:0");
        config.query_timeout = Duration::from_secs(2);
        configure(&mut config);
        let federator = QueryFederator::new(
            Arc::clone(&storage),
            QueryDedupCache::new(Arc::clone(&storage), Duration::from_secs(60)),
            directory,
            gateway,
            Arc::clone(&identity),
            FederationSettings::from(&config),
        );
        Pod {
            federator,
            storage,
            identity,
            pool,
        }
    }

    fn caller() -> Principal {
        Principal::Account {
            account_id: Uuid::now_v7(),
        }
    }

    async fn photo(pod: &Pod, album: &str) -> Record {
        let mut fields = Map::new();
        fields.insert("album".into(), json!(album));
        let record = Record::new("photo", pod.identity.member_id, fields);
        pod.storage.append_record(&record).await.unwrap();
        record
    }

    async fn link(pod: &Pod, target: Uuid, relation: &str) {
        pod.storage
            .put_link(&NetworkLink {
                owner_member_id: pod.identity.member_id,
                target_member_id: target,
                relation: relation.into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    /// A member whose pod is registered at a port nothing listens on.
    async fn unreachable_member(pod: &Pod) -> Uuid {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let other = PodIdentity::ephemeral(Uuid::now_v7(), "photos");
        pod.federator
            .directory
            .register(&MemberInfo {
                member_id: other.member_id,
                service_id: "photos".into(),
                pod_url: format!("http://127.0.0.1:{port}"),
                data_certificate: other.certificate.clone(),
            })
            .await
            .unwrap();
        other.member_id
    }

    /// A stand-in pod that answers every query with no items after `delay`,
    /// recording the bodies it receives and how many were in flight at once.
    #[derive(Default)]
    struct Peer {
        bodies: Mutex<Vec<Value>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    async fn spawn_peer(peer: Arc<Peer>, delay: Duration) -> String {
        let app = Router::new().route(
            "/v1/classes/{class}/query",
            post(move |Json(body): Json<Value>| {
                let peer = Arc::clone(&peer);
                async move {
                    let now = peer.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peer.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    peer.in_flight.fetch_sub(1, Ordering::SeqCst);
                    peer.bodies.lock().unwrap().push(body);
                    Json(QueryResponse {
                        items: Vec::new(),
                        total_count: 0,
                        page_info: PageInfo {
                            end_cursor: None,
                            has_next_page: false,
                        },
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    /// Link a new member living at `pod_url` as a friend of `pod`.
    async fn friend_at(pod: &Pod, pod_url: &str) -> Uuid {
        let other = PodIdentity::ephemeral(Uuid::now_v7(), "photos");
        pod.federator
            .directory
            .register(&MemberInfo {
                member_id: other.member_id,
                service_id: "photos".into(),
                pod_url: pod_url.into(),
                data_certificate: other.certificate.clone(),
            })
            .await
            .unwrap();
        link(pod, other.member_id, "friend").await;
        other.member_id
    }

    fn friends_query() -> RecursiveQuery {
        let mut query = RecursiveQuery::new("photo");
        query.depth = 1;
        query.relations = vec!["friend".into()];
        query
    }

    fn forwarded_deadline(peer: &Peer) -> DateTime<Utc> {
        let bodies = peer.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        serde_json::from_value(bodies[0]["deadline"].clone()).unwrap()
    }

    #[tokio::test]
    async fn local_query_filters_records() {
        let pod = pod();
        let trip = photo(&pod, "trips").await;
        photo(&pod, "pets").await;

        let mut query = RecursiveQuery::new("photo");
        query.filters = FilterSet::new().with("album", Comparator::Eq, json!("trips"));
        let resp = pod
            .federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert_eq!(resp.items, vec![trip.clone()]);
        assert_eq!(resp.total_count, 1);
        assert_eq!(resp.page_info.end_cursor, Some(trip.id));
    }

    #[tokio::test]
    async fn fresh_query_needs_a_caller() {
        let pod = pod();
        let err = pod
            .federator
            .execute(QueryRequest::new(RecursiveQuery::new("photo")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::IdentityRequired));
    }

    #[tokio::test]
    async fn repeated_query_id_is_refused() {
        let pod = pod();
        let query = RecursiveQuery::new("photo");
        pod.federator
            .execute(QueryRequest::new(query.clone()), Some(&caller()))
            .await
            .unwrap();
        let err = pod
            .federator
            .execute(QueryRequest::new(query.clone()), Some(&caller()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::DuplicateQuery(id) if id == query.query_id));
    }

    #[tokio::test]
    async fn malformed_filters_fail_before_registration() {
        let pod = pod();
        let mut query = RecursiveQuery::new("photo");
        query.filters = serde_json::from_value(json!({ "album": { "like": "t%" } })).unwrap();
        let err = pod
            .federator
            .execute(QueryRequest::new(query.clone()), Some(&caller()))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::FilterMalformed(_)));
        assert!(!pod.federator.dedup.exists(query.query_id).await.unwrap());
    }

    #[tokio::test]
    async fn depth_zero_makes_no_calls() {
        let pod = pod();
        let target = unreachable_member(&pod).await;
        link(&pod, target, "friend").await;

        let mut query = RecursiveQuery::new("photo");
        query.relations = vec!["friend".into()];
        pod.federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert!(pod.pool.is_empty());
    }

    #[tokio::test]
    async fn unreachable_targets_are_omitted() {
        let pod = pod();
        let mine = photo(&pod, "trips").await;
        let target = unreachable_member(&pod).await;
        link(&pod, target, "friend").await;

        let mut query = RecursiveQuery::new("photo");
        query.depth = 1;
        query.relations = vec!["friend".into()];
        let resp = pod
            .federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert_eq!(resp.items, vec![mine]);
        assert_eq!(pod.pool.len(), 1);
    }

    #[tokio::test]
    async fn entry_deadline_is_carried_to_targets() {
        let pod = pod();
        let peer = Arc::new(Peer::default());
        let url = spawn_peer(Arc::clone(&peer), Duration::ZERO).await;
        friend_at(&pod, &url).await;

        let deadline = Utc::now() + chrono::Duration::milliseconds(1500);
        let mut query = friends_query();
        query.deadline = Some(deadline);
        pod.federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert_eq!(forwarded_deadline(&peer), deadline);
    }

    #[tokio::test]
    async fn far_deadline_is_clamped_to_query_timeout() {
        let pod = pod();
        let peer = Arc::new(Peer::default());
        let url = spawn_peer(Arc::clone(&peer), Duration::ZERO).await;
        friend_at(&pod, &url).await;

        let mut query = friends_query();
        query.deadline = Some(Utc::now() + chrono::Duration::days(30));
        let sent = Utc::now();
        pod.federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        // query_timeout is 2s in these pods.
        let forwarded = forwarded_deadline(&peer);
        assert!(forwarded <= Utc::now() + chrono::Duration::seconds(2));
        assert!(forwarded >= sent + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn passed_deadline_stops_fan_out() {
        let pod = pod();
        let mine = photo(&pod, "trips").await;
        let peer = Arc::new(Peer::default());
        let url = spawn_peer(Arc::clone(&peer), Duration::ZERO).await;
        friend_at(&pod, &url).await;

        let mut query = friends_query();
        query.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        let resp = pod
            .federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert_eq!(resp.items, vec![mine]);
        assert!(peer.bodies.lock().unwrap().is_empty());
        assert!(pod.pool.is_empty());
    }

    #[tokio::test]
    async fn fan_out_respects_the_limit() {
        let pod = pod_with(|config| config.fanout_limit = 2);
        let peer = Arc::new(Peer::default());
        let url = spawn_peer(Arc::clone(&peer), Duration::from_millis(100)).await;
        for _ in 0..5 {
            friend_at(&pod, &url).await;
        }

        pod.federator
            .execute(QueryRequest::new(friends_query()), Some(&caller()))
            .await
            .unwrap();
        assert_eq!(peer.bodies.lock().unwrap().len(), 5);
        assert_eq!(peer.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn named_member_does_not_forward_to_itself() {
        let pod = pod();
        let mut query = RecursiveQuery::new("photo");
        query.depth = 2;
        query.remote_member_id = Some(pod.identity.member_id);
        assert!(pod.federator.targets(&query).await.unwrap().is_empty());

        pod.federator
            .execute(QueryRequest::new(query), Some(&caller()))
            .await
            .unwrap();
        assert!(pod.pool.is_empty());
    }

    #[tokio::test]
    async fn targets_follow_listed_relations_only() {
        let pod = pod();
        let friend = Uuid::now_v7();
        let family = Uuid::now_v7();
        link(&pod, friend, "friend").await;
        link(&pod, family, "family").await;
        link(&pod, pod.identity.member_id, "friend").await;

        let mut query = RecursiveQuery::new("photo");
        query.relations = vec!["friend".into()];
        assert_eq!(pod.federator.targets(&query).await.unwrap(), vec![friend]);

        query.remote_member_id = Some(family);
        assert_eq!(pod.federator.targets(&query).await.unwrap(), vec![family]);
    }

    #[tokio::test]
    async fn assertion_must_cover_received_scope() {
        let origin = pod();
        let receiver = pod();
        receiver
            .federator
            .directory
            .register(&MemberInfo {
                member_id: origin.identity.member_id,
                service_id: "photos".into(),
                pod_url: "http://127.0.0.1:1".into(),
                data_certificate: origin.identity.certificate.clone(),
            })
            .await
            .unwrap();

        let mut query = RecursiveQuery::new("photo");
        query.relations = vec!["friend".into()];
        let assertion = OriginAssertion::mint(
            origin.identity.signing_key(),
            origin.identity.member_id,
            origin.federator.scope(&query),
            Utc::now(),
        )
        .unwrap();

        let mut tampered = query.clone();
        tampered.relations = vec!["family".into()];
        let err = receiver
            .federator
            .execute(QueryRequest::forwarded(tampered, &assertion), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::SignatureInvalid(_)));

        receiver
            .federator
            .execute(QueryRequest::forwarded(query, &assertion), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn partial_assertion_is_malformed() {
        let pod = pod();
        let mut request = QueryRequest::new(RecursiveQuery::new("photo"));
        request.origin_member_id = Some(Uuid::now_v7());
        let err = pod.federator.execute(request, Some(&caller())).await.unwrap_err();
        assert!(matches!(err, NodeError::FilterMalformed(_)));
    }

    #[test]
    fn merge_skips_known_ids() {
        let owner = Uuid::now_v7();
        let a = Record::new("photo", owner, Map::new());
        let b = Record::new("photo", owner, Map::new());
        let mut response = QueryResponse {
            items: vec![a.clone()],
            total_count: 3,
            page_info: PageInfo {
                end_cursor: Some(a.id),
                has_next_page: true,
            },
        };
        merge(&mut response, vec![a.clone(), b.clone()]);
        assert_eq!(response.items, vec![a.clone(), b]);
        assert_eq!(response.total_count, 4);
        assert_eq!(response.page_info.end_cursor, Some(a.id));
    }
}
