//! Storage abstraction layer for a pod.
//!
//! The [`Storage`] trait defines the contract between the federation layer,
//! the HTTP handlers, and persistence. Storage knows nothing about callers or
//! signatures; it only keeps data and answers keyed lookups.
//!
//! # Implementations
//!
//! | Type | When to use |
//! |------|-------------|
//! | [`MemoryStorage`] | Tests, conformance suite, ephemeral pods |
//! | [`SqliteStorage`] | Production; durable single-file database |
//!
//! [`MemoryStorage`]: memory::MemoryStorage
//! [`SqliteStorage`]: sqlite::SqliteStorage

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podnet::{ContentKey, Predicate, QueryPage, Record, RecursiveQuery};
use podnet_node_api::{MemberInfo, NetworkLink};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Errors that storage operations can return.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,

    /// An item with the same key already exists (e.g. duplicate record id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An unexpected error in the underlying storage backend.
    #[error("internal storage error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// NewContentKey
// ---------------------------------------------------------------------------

/// Input to [`Storage::create_content_key`].
#[derive(Debug, Clone)]
pub struct NewContentKey {
    pub member_id: Uuid,
    /// `None` assigns one past the member's current highest id.
    pub key_id: Option<u32>,
    pub key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// The persistence contract for a pod.
///
/// All methods are `async` and return `Result<_, StorageError>`. Implementations
/// must be `Send + Sync + 'static` so they can be held in an `Arc<dyn Storage>`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // --- Records -------------------------------------------------------------

    /// Persist a record. Returns [`StorageError::Conflict`] if a record with
    /// the same `id` already exists.
    async fn append_record(&self, record: &Record) -> Result<(), StorageError>;

    /// Run `query` against local records of `query.class_name`, keeping only
    /// those matching every predicate. Records are scanned in `id` order.
    async fn query_records(
        &self,
        query: &RecursiveQuery,
        predicates: &[Predicate],
    ) -> Result<QueryPage, StorageError>;

    // --- Network links -------------------------------------------------------

    /// Add a link. Idempotent on `(owner, target, relation)`; the original
    /// `created_at` is kept.
    async fn put_link(&self, link: &NetworkLink) -> Result<(), StorageError>;

    /// Remove a link. Returns `false` if it did not exist.
    async fn delete_link(
        &self,
        owner: Uuid,
        target: Uuid,
        relation: &str,
    ) -> Result<bool, StorageError>;

    /// All links owned by `owner`, oldest first.
    async fn list_links(&self, owner: Uuid) -> Result<Vec<NetworkLink>, StorageError>;

    // --- Member directory cache ---------------------------------------------

    /// Insert or replace a directory entry.
    async fn put_member(&self, member: &MemberInfo) -> Result<(), StorageError>;

    async fn get_member(&self, member_id: Uuid) -> Result<Option<MemberInfo>, StorageError>;

    // --- Query markers (dedup cache) ----------------------------------------

    /// Register `query_id` until `expires_at`. Returns `false` if a live
    /// marker already exists; an expired one is replaced. Atomic.
    async fn insert_query_marker(
        &self,
        query_id: Uuid,
        origin: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// `true` if a marker for `query_id` exists and has not expired at `now`.
    async fn query_marker_exists(
        &self,
        query_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Remove a marker. Returns `false` if none existed.
    async fn delete_query_marker(&self, query_id: Uuid) -> Result<bool, StorageError>;

    /// Drop every marker that expired at or before `now`; returns how many.
    async fn purge_query_markers(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;

    // --- Content keys --------------------------------------------------------

    /// Store a new key, assigning `key_id` atomically when it is `None`.
    /// Returns [`StorageError::Conflict`] if the member already has that id.
    async fn create_content_key(&self, new: NewContentKey) -> Result<ContentKey, StorageError>;

    async fn get_content_key(
        &self,
        member_id: Uuid,
        key_id: u32,
    ) -> Result<Option<ContentKey>, StorageError>;

    /// All of a member's keys, ordered by `key_id` ascending.
    async fn list_content_keys(&self, member_id: Uuid) -> Result<Vec<ContentKey>, StorageError>;
}
