//! SQLite-backed storage implementation.
//!
//! Uses `rusqlite` (with bundled SQLite) wrapped in an `Arc<Mutex<Connection>>`
//! to satisfy the `Send + Sync` requirements. All blocking calls are offloaded
//! to a thread-pool via `tokio::task::spawn_blocking`.
//!
//! # Schema
//!
//! - `records` — full JSON blob plus the columns used for scanning.
//! - `network_links` — (owner, target, relation) edges.
//! - `members` — member directory cache.
//! - `query_markers` — in-flight query ids with their expiry.
//! - `content_keys` — per-member token keys.
//!
//! Timestamps are stored as RFC 3339 text with a fixed `Z` offset and
//! microsecond precision, so lexicographic comparison matches time order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use podnet::{select, ContentKey, Predicate, QueryPage, Record, RecursiveQuery};
use podnet_node_api::{MemberInfo, NetworkLink};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{NewContentKey, Storage, StorageError};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id          TEXT PRIMARY KEY,
    class_name  TEXT NOT NULL,
    owner       TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_class ON records(class_name, id);

CREATE TABLE IF NOT EXISTS network_links (
    owner       TEXT NOT NULL,
    target      TEXT NOT NULL,
    relation    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (owner, target, relation)
);

CREATE TABLE IF NOT EXISTS members (
    member_id   TEXT PRIMARY KEY,
    data        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS query_markers (
    query_id    TEXT PRIMARY KEY,
    origin      TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_query_markers_expiry ON query_markers(expires_at);

CREATE TABLE IF NOT EXISTS content_keys (
    member_id   TEXT NOT NULL,
    key_id      INTEGER NOT NULL,
    key         TEXT NOT NULL,
    not_before  TEXT NOT NULL,
    not_after   TEXT,
    PRIMARY KEY (member_id, key_id)
);
";

// ---------------------------------------------------------------------------
// SqliteStorage
// ---------------------------------------------------------------------------

/// SQLite-backed implementation of [`Storage`].
///
/// Holds a single database connection protected by a `Mutex`. All operations
/// run inside `spawn_blocking` to avoid blocking the async runtime.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the SQLite database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database (data is lost when dropped).
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection in the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("task join error: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn map_err(e: rusqlite::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn map_json_err(e: serde_json::Error) -> StorageError {
    StorageError::Internal(format!("JSON error: {e}"))
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Internal(format!("bad timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    s.parse()
        .map_err(|e| StorageError::Internal(format!("bad uuid {s:?}: {e}")))
}

type ContentKeyRow = (String, u32, String, String, Option<String>);

fn content_key_from_row(row: ContentKeyRow) -> Result<ContentKey, StorageError> {
    let (member_id, key_id, key, not_before, not_after) = row;
    Ok(ContentKey {
        member_id: parse_uuid(&member_id)?,
        key_id,
        key,
        not_before: parse_ts(&not_before)?,
        not_after: not_after.as_deref().map(parse_ts).transpose()?,
    })
}

fn read_content_key_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentKeyRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

// ---------------------------------------------------------------------------
// Storage impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Storage for SqliteStorage {
    // --- Records -------------------------------------------------------------

    async fn append_record(&self, record: &Record) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&record).map_err(map_json_err)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO records (id, class_name, owner, data)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.id.to_string(),
                        record.class_name,
                        record.owner_member_id.to_string(),
                        data
                    ],
                )
                .map_err(map_err)?;
            if inserted == 0 {
                return Err(StorageError::Conflict(format!(
                    "record {} already exists",
                    record.id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn query_records(
        &self,
        query: &RecursiveQuery,
        predicates: &[Predicate],
    ) -> Result<QueryPage, StorageError> {
        let query = query.clone();
        let predicates = predicates.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT data FROM records WHERE class_name = ?1 ORDER BY id")
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![query.class_name], |row| row.get::<_, String>(0))
                .map_err(map_err)?;
            let mut records = Vec::new();
            for row in rows {
                let data = row.map_err(map_err)?;
                records.push(serde_json::from_str::<Record>(&data).map_err(map_json_err)?);
            }
            Ok(select(&records, &predicates, &query))
        })
        .await
    }

    // --- Network links -------------------------------------------------------

    async fn put_link(&self, link: &NetworkLink) -> Result<(), StorageError> {
        let link = link.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO network_links (owner, target, relation, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    link.owner_member_id.to_string(),
                    link.target_member_id.to_string(),
                    link.relation,
                    ts(&link.created_at)
                ],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn delete_link(
        &self,
        owner: Uuid,
        target: Uuid,
        relation: &str,
    ) -> Result<bool, StorageError> {
        let relation = relation.to_string();
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM network_links WHERE owner = ?1 AND target = ?2 AND relation = ?3",
                    params![owner.to_string(), target.to_string(), relation],
                )
                .map_err(map_err)?;
            Ok(n > 0)
        })
        .await
    }

    async fn list_links(&self, owner: Uuid) -> Result<Vec<NetworkLink>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT target, relation, created_at FROM network_links
                     WHERE owner = ?1 ORDER BY created_at, target, relation",
                )
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![owner.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(map_err)?;
            let mut links = Vec::new();
            for row in rows {
                let (target, relation, created_at) = row.map_err(map_err)?;
                links.push(NetworkLink {
                    owner_member_id: owner,
                    target_member_id: parse_uuid(&target)?,
                    relation,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(links)
        })
        .await
    }

    // --- Member directory cache ---------------------------------------------

    async fn put_member(&self, member: &MemberInfo) -> Result<(), StorageError> {
        let member = member.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&member).map_err(map_json_err)?;
            conn.execute(
                "INSERT INTO members (member_id, data) VALUES (?1, ?2)
                 ON CONFLICT(member_id) DO UPDATE SET data = excluded.data",
                params![member.member_id.to_string(), data],
            )
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn get_member(&self, member_id: Uuid) -> Result<Option<MemberInfo>, StorageError> {
        self.with_conn(move |conn| {
            let data = conn
                .query_row(
                    "SELECT data FROM members WHERE member_id = ?1",
                    params![member_id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(map_err)?;
            data.map(|d| serde_json::from_str(&d).map_err(map_json_err))
                .transpose()
        })
        .await
    }

    // --- Query markers -------------------------------------------------------

    async fn insert_query_marker(
        &self,
        query_id: Uuid,
        origin: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let origin = origin.to_string();
        self.with_conn(move |conn| {
            // A single upsert keeps check-and-set atomic: an expired marker is
            // overwritten, a live one is left alone.
            let n = conn
                .execute(
                    "INSERT INTO query_markers (query_id, origin, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(query_id) DO UPDATE
                       SET origin = excluded.origin, expires_at = excluded.expires_at
                       WHERE query_markers.expires_at <= ?4",
                    params![
                        query_id.to_string(),
                        origin,
                        ts(&expires_at),
                        ts(&Utc::now())
                    ],
                )
                .map_err(map_err)?;
            Ok(n > 0)
        })
        .await
    }

    async fn query_marker_exists(
        &self,
        query_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM query_markers WHERE query_id = ?1 AND expires_at > ?2",
                    params![query_id.to_string(), ts(&now)],
                    |row| row.get(0),
                )
                .map_err(map_err)?;
            Ok(count > 0)
        })
        .await
    }

    async fn delete_query_marker(&self, query_id: Uuid) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM query_markers WHERE query_id = ?1",
                    params![query_id.to_string()],
                )
                .map_err(map_err)?;
            Ok(n > 0)
        })
        .await
    }

    async fn purge_query_markers(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "DELETE FROM query_markers WHERE expires_at <= ?1",
                    params![ts(&now)],
                )
                .map_err(map_err)?;
            Ok(n as u64)
        })
        .await
    }

    // --- Content keys --------------------------------------------------------

    async fn create_content_key(&self, new: NewContentKey) -> Result<ContentKey, StorageError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(map_err)?;
            let member = new.member_id.to_string();
            let key_id = match new.key_id {
                Some(id) => id,
                None => {
                    let max: Option<u32> = tx
                        .query_row(
                            "SELECT MAX(key_id) FROM content_keys WHERE member_id = ?1",
                            params![member],
                            |row| row.get(0),
                        )
                        .map_err(map_err)?;
                    match max {
                        None => 1,
                        Some(m) => m.checked_add(1).ok_or_else(|| {
                            StorageError::Conflict(format!(
                                "content key ids exhausted for member {member}"
                            ))
                        })?,
                    }
                }
            };
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO content_keys (member_id, key_id, key, not_before, not_after)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        member,
                        key_id,
                        new.key,
                        ts(&new.not_before),
                        new.not_after.as_ref().map(ts)
                    ],
                )
                .map_err(map_err)?;
            if inserted == 0 {
                return Err(StorageError::Conflict(format!(
                    "content key {key_id} already exists for member {member}"
                )));
            }
            tx.commit().map_err(map_err)?;
            Ok(ContentKey {
                member_id: new.member_id,
                key_id,
                key: new.key,
                not_before: new.not_before,
                not_after: new.not_after,
            })
        })
        .await
    }

    async fn get_content_key(
        &self,
        member_id: Uuid,
        key_id: u32,
    ) -> Result<Option<ContentKey>, StorageError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT member_id, key_id, key, not_before, not_after FROM content_keys
                     WHERE member_id = ?1 AND key_id = ?2",
                    params![member_id.to_string(), key_id],
                    read_content_key_row,
                )
                .optional()
                .map_err(map_err)?;
            row.map(content_key_from_row).transpose()
        })
        .await
    }

    async fn list_content_keys(&self, member_id: Uuid) -> Result<Vec<ContentKey>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT member_id, key_id, key, not_before, not_after FROM content_keys
                     WHERE member_id = ?1 ORDER BY key_id",
                )
                .map_err(map_err)?;
            let rows = stmt
                .query_map(params![member_id.to_string()], read_content_key_row)
                .map_err(map_err)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(content_key_from_row(row.map_err(map_err)?)?);
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use podnet::{Comparator, DataCertificate, FilterSet};
    use serde_json::{json, Map};

    fn record(owner: Uuid, likes: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("likes".into(), json!(likes));
        Record::new("photo", owner, fields)
    }

    #[tokio::test]
    async fn append_and_query_with_pagination() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let owner = Uuid::now_v7();
        for i in 0..5 {
            s.append_record(&record(owner, i)).await.unwrap();
        }

        let mut q = RecursiveQuery::new("photo");
        q.first = Some(2);
        q.filters = FilterSet::new().with("likes", Comparator::AtAfter, json!(1));
        let predicates = q.validate().unwrap();
        let page = s.query_records(&q, &predicates).await.unwrap();
        assert_eq!(page.total_count, 4);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_next_page);
        assert_eq!(page.items[0].fields["likes"], 1);
    }

    #[tokio::test]
    async fn append_conflict() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let r = record(Uuid::now_v7(), 1);
        s.append_record(&r).await.unwrap();
        assert!(matches!(
            s.append_record(&r).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn link_roundtrip() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let link = NetworkLink {
            owner_member_id: a,
            target_member_id: b,
            relation: "friend".into(),
            created_at: Utc::now(),
        };
        s.put_link(&link).await.unwrap();
        s.put_link(&link).await.unwrap();
        let links = s.list_links(a).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_member_id, b);
        assert!(s.list_links(b).await.unwrap().is_empty());
        assert!(s.delete_link(a, b, "friend").await.unwrap());
    }

    #[tokio::test]
    async fn member_upsert() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let mut info = MemberInfo {
            member_id: Uuid::now_v7(),
            service_id: "photos".into(),
            pod_url: "https://old.example.net".into(),
            data_certificate: DataCertificate {
                public_key: "z6MkTest".into(),
            },
        };
        s.put_member(&info).await.unwrap();
        info.pod_url = "https://new.example.net".into();
        s.put_member(&info).await.unwrap();
        assert_eq!(s.get_member(info.member_id).await.unwrap(), Some(info));
        assert_eq!(s.get_member(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn markers_first_set_wins_and_purge() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let id = Uuid::now_v7();
        let later = Utc::now() + Duration::minutes(5);
        assert!(s.insert_query_marker(id, "a", later).await.unwrap());
        assert!(!s.insert_query_marker(id, "b", later).await.unwrap());
        assert!(s.query_marker_exists(id, Utc::now()).await.unwrap());

        let stale = Uuid::now_v7();
        s.insert_query_marker(stale, "a", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(s.purge_query_markers(Utc::now()).await.unwrap(), 1);
        assert!(s.delete_query_marker(id).await.unwrap());
        assert!(!s.delete_query_marker(id).await.unwrap());
    }

    #[tokio::test]
    async fn content_keys_assign_and_list() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let member = Uuid::now_v7();
        let now = Utc::now().trunc_subsecs(6);
        let new = |key_id| NewContentKey {
            member_id: member,
            key_id,
            key: "k".into(),
            not_before: now,
            not_after: Some(now + Duration::days(1)),
        };
        assert_eq!(s.create_content_key(new(None)).await.unwrap().key_id, 1);
        assert_eq!(s.create_content_key(new(None)).await.unwrap().key_id, 2);
        assert!(matches!(
            s.create_content_key(new(Some(2))).await,
            Err(StorageError::Conflict(_))
        ));
        let got = s.get_content_key(member, 2).await.unwrap().unwrap();
        assert_eq!(got.not_after, Some(now + Duration::days(1)));
        assert_eq!(s.list_content_keys(member).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn content_key_ids_do_not_wrap() {
        let s = SqliteStorage::open_in_memory().unwrap();
        let member = Uuid::now_v7();
        let new = |key_id| NewContentKey {
            member_id: member,
            key_id,
            key: "k".into(),
            not_before: Utc::now(),
            not_after: None,
        };
        s.create_content_key(new(Some(u32::MAX))).await.unwrap();
        assert!(matches!(
            s.create_content_key(new(None)).await,
            Err(StorageError::Conflict(_))
        ));
        assert!(s.get_content_key(member, 0).await.unwrap().is_none());
    }
}
