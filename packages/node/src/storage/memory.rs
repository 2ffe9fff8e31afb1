//! In-memory storage implementation.
//!
//! All data is held in RAM behind a [`RwLock`] and is lost when the process
//! exits. Use this for tests, the conformance suite, and ephemeral pods.
//!
//! Records are stored in a [`BTreeMap`] keyed by UUIDv7 id, so iteration is
//! already in creation order and keyset pagination needs no secondary index.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podnet::{select, ContentKey, Predicate, QueryPage, Record, RecursiveQuery};
use podnet_node_api::{MemberInfo, NetworkLink};
use uuid::Uuid;

use super::{NewContentKey, Storage, StorageError};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    records: BTreeMap<Uuid, Record>,
    links: Vec<NetworkLink>,
    members: HashMap<Uuid, MemberInfo>,
    /// query id → (origin, expires_at).
    markers: HashMap<Uuid, (String, DateTime<Utc>)>,
    /// member id → key id → key.
    content_keys: HashMap<Uuid, BTreeMap<u32, ContentKey>>,
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// Thread-safe, in-memory implementation of [`Storage`].
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Storage impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Storage for MemoryStorage {
    // --- Records -------------------------------------------------------------

    async fn append_record(&self, record: &Record) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        if inner.records.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "record {} already exists",
                record.id
            )));
        }
        inner.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn query_records(
        &self,
        query: &RecursiveQuery,
        predicates: &[Predicate],
    ) -> Result<QueryPage, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(select(inner.records.values(), predicates, query))
    }

    // --- Network links -------------------------------------------------------

    async fn put_link(&self, link: &NetworkLink) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let exists = inner.links.iter().any(|l| {
            l.owner_member_id == link.owner_member_id
                && l.target_member_id == link.target_member_id
                && l.relation == link.relation
        });
        if !exists {
            inner.links.push(link.clone());
        }
        Ok(())
    }

    async fn delete_link(
        &self,
        owner: Uuid,
        target: Uuid,
        relation: &str,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.links.len();
        inner.links.retain(|l| {
            !(l.owner_member_id == owner && l.target_member_id == target && l.relation == relation)
        });
        Ok(inner.links.len() != before)
    }

    async fn list_links(&self, owner: Uuid) -> Result<Vec<NetworkLink>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .links
            .iter()
            .filter(|l| l.owner_member_id == owner)
            .cloned()
            .collect())
    }

    // --- Member directory cache ---------------------------------------------

    async fn put_member(&self, member: &MemberInfo) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        inner.members.insert(member.member_id, member.clone());
        Ok(())
    }

    async fn get_member(&self, member_id: Uuid) -> Result<Option<MemberInfo>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.members.get(&member_id).cloned())
    }

    // --- Query markers -------------------------------------------------------

    async fn insert_query_marker(
        &self,
        query_id: Uuid,
        origin: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        if inner
            .markers
            .get(&query_id)
            .is_some_and(|(_, expiry)| *expiry > now)
        {
            return Ok(false);
        }
        inner
            .markers
            .insert(query_id, (origin.to_string(), expires_at));
        Ok(true)
    }

    async fn query_marker_exists(
        &self,
        query_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .markers
            .get(&query_id)
            .is_some_and(|(_, expiry)| *expiry > now))
    }

    async fn delete_query_marker(&self, query_id: Uuid) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner.markers.remove(&query_id).is_some())
    }

    async fn purge_query_markers(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.markers.len();
        inner.markers.retain(|_, (_, expiry)| *expiry > now);
        Ok((before - inner.markers.len()) as u64)
    }

    // --- Content keys --------------------------------------------------------

    async fn create_content_key(&self, new: NewContentKey) -> Result<ContentKey, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let keys = inner.content_keys.entry(new.member_id).or_default();
        let key_id = match new.key_id {
            Some(id) => id,
            None => match keys.keys().next_back() {
                None => 1,
                Some(max) => max.checked_add(1).ok_or_else(|| {
                    StorageError::Conflict(format!(
                        "content key ids exhausted for member {}",
                        new.member_id
                    ))
                })?,
            },
        };
        if keys.contains_key(&key_id) {
            return Err(StorageError::Conflict(format!(
                "content key {key_id} already exists for member {}",
                new.member_id
            )));
        }
        let key = ContentKey {
            member_id: new.member_id,
            key_id,
            key: new.key,
            not_before: new.not_before,
            not_after: new.not_after,
        };
        keys.insert(key_id, key.clone());
        Ok(key)
    }

    async fn get_content_key(
        &self,
        member_id: Uuid,
        key_id: u32,
    ) -> Result<Option<ContentKey>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .content_keys
            .get(&member_id)
            .and_then(|keys| keys.get(&key_id))
            .cloned())
    }

    async fn list_content_keys(&self, member_id: Uuid) -> Result<Vec<ContentKey>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .content_keys
            .get(&member_id)
            .map(|keys| keys.values().cloned().collect())
            .unwrap_or_default())
    }
}
