//! Content keys for one member and the tokens they sign.
//!
//! A member holds a numbered series of symmetric keys. New tokens are issued
//! with the ACTIVE key of highest id; any non-expired key verifies the tokens
//! it issued, so rotation does not break URLs already handed out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use podnet::{select_active, ContentKey, ContentTokenParams};
use uuid::Uuid;

use crate::{
    error::NodeError,
    storage::{NewContentKey, Storage},
};

#[derive(Clone)]
pub struct ContentKeyring {
    storage: Arc<dyn Storage>,
    member_id: Uuid,
}

impl ContentKeyring {
    pub fn new(storage: Arc<dyn Storage>, member_id: Uuid) -> Self {
        Self { storage, member_id }
    }

    pub fn member_id(&self) -> Uuid {
        self.member_id
    }

    /// Store a new key. `key_id` defaults to one past the current highest,
    /// `not_before` to now.
    pub async fn create(
        &self,
        key: impl Into<String>,
        key_id: Option<u32>,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<ContentKey, NodeError> {
        let key = key.into();
        if key.is_empty() {
            return Err(NodeError::InvalidInput("content key must not be empty".into()));
        }
        let not_before = not_before.unwrap_or_else(Utc::now);
        if not_after.is_some_and(|end| end < not_before) {
            return Err(NodeError::InvalidInput(
                "not_after precedes not_before".into(),
            ));
        }
        let created = self
            .storage
            .create_content_key(NewContentKey {
                member_id: self.member_id,
                key_id,
                key,
                not_before,
                not_after,
            })
            .await?;
        tracing::info!(
            "keyring: created content key {} for member {}",
            created.key_id,
            self.member_id
        );
        Ok(created)
    }

    pub async fn keys(&self) -> Result<Vec<ContentKey>, NodeError> {
        Ok(self.storage.list_content_keys(self.member_id).await?)
    }

    pub async fn get_active_content_key(&self) -> Result<ContentKey, NodeError> {
        let keys = self.keys().await?;
        select_active(&keys, Utc::now())
            .cloned()
            .ok_or_else(|| NodeError::KeyNotFound("no active content key".into()))
    }

    async fn key(&self, key_id: Option<u32>) -> Result<ContentKey, NodeError> {
        match key_id {
            None => self.get_active_content_key().await,
            Some(id) => self
                .storage
                .get_content_key(self.member_id, id)
                .await?
                .ok_or_else(|| NodeError::KeyNotFound(id.to_string())),
        }
    }

    /// Token for one asset, from `key_id` or the active key. Returns the
    /// token with the id of the key that produced it.
    pub async fn generate_token(
        &self,
        service_id: &str,
        member_id: Uuid,
        asset_id: &str,
        key_id: Option<u32>,
    ) -> Result<(String, u32), NodeError> {
        let key = self.key(key_id).await?;
        if key.status(Utc::now()) == podnet::KeyStatus::Expired {
            return Err(NodeError::KeyExpired(key.key_id));
        }
        Ok((key.generate_token(service_id, member_id, asset_id), key.key_id))
    }

    /// The query string to append to a CDN asset URL, signed with the
    /// active key.
    pub async fn generate_url_query_parameters(
        &self,
        service_id: &str,
        member_id: Uuid,
        asset_id: &str,
    ) -> Result<String, NodeError> {
        let key = self.get_active_content_key().await?;
        Ok(key.generate_url_query_parameters(service_id, member_id, asset_id))
    }

    /// Accept `params.content_token` only if the key exists, has not
    /// expired, and the recomputed token matches exactly.
    pub async fn verify(&self, params: &ContentTokenParams) -> Result<(), NodeError> {
        let key = self.key(Some(params.key_id)).await?;
        key.verify_token(
            &params.service_id,
            params.member_id,
            &params.asset_id,
            &params.content_token,
            Utc::now(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{memory::MemoryStorage, StorageError};
    use chrono::Duration;

    fn keyring() -> ContentKeyring {
        ContentKeyring::new(Arc::new(MemoryStorage::new()), Uuid::now_v7())
    }

    fn params(ring: &ContentKeyring, key_id: u32, token: String) -> ContentTokenParams {
        ContentTokenParams {
            service_id: "photos".into(),
            member_id: ring.member_id(),
            asset_id: "album/1.jpg".into(),
            key_id,
            content_token: token,
        }
    }

    #[tokio::test]
    async fn key_ids_are_assigned_in_sequence() {
        let ring = keyring();
        assert_eq!(ring.create("k1", None, None, None).await.unwrap().key_id, 1);
        assert_eq!(ring.create("k7", Some(7), None, None).await.unwrap().key_id, 7);
        assert_eq!(ring.create("k8", None, None, None).await.unwrap().key_id, 8);
        let err = ring.create("dup", Some(7), None, None).await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn exhausted_key_ids_are_a_conflict() {
        let ring = keyring();
        ring.create("max", Some(u32::MAX), None, None).await.unwrap();
        let err = ring.create("next", None, None, None).await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(StorageError::Conflict(_))));
        // The store is still usable afterwards.
        assert_eq!(ring.keys().await.unwrap().len(), 1);
        ring.create("low", Some(3), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn active_key_skips_future_and_expired() {
        let ring = keyring();
        let now = Utc::now();
        assert!(matches!(
            ring.get_active_content_key().await,
            Err(NodeError::KeyNotFound(_))
        ));
        ring.create("old", None, Some(now - Duration::days(2)), Some(now - Duration::days(1)))
            .await
            .unwrap();
        ring.create("current", None, Some(now - Duration::hours(1)), None)
            .await
            .unwrap();
        ring.create("next", None, Some(now + Duration::days(1)), None)
            .await
            .unwrap();
        assert_eq!(ring.get_active_content_key().await.unwrap().key_id, 2);
    }

    #[tokio::test]
    async fn issued_tokens_verify() {
        let ring = keyring();
        ring.create("secret", None, None, None).await.unwrap();
        let (token, key_id) = ring
            .generate_token("photos", ring.member_id(), "album/1.jpg", None)
            .await
            .unwrap();
        assert_eq!(key_id, 1);
        ring.verify(&params(&ring, key_id, token.clone())).await.unwrap();

        let mut tampered = params(&ring, key_id, token);
        tampered.asset_id = "album/2.jpg".into();
        assert!(matches!(
            ring.verify(&tampered).await,
            Err(NodeError::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn url_parameters_parse_back_and_verify() {
        let ring = keyring();
        ring.create("secret", None, None, None).await.unwrap();
        let query = ring
            .generate_url_query_parameters("photos", ring.member_id(), "album/1.jpg")
            .await
            .unwrap();
        let parsed = ContentTokenParams::parse(&query).unwrap();
        assert_eq!(parsed.key_id, 1);
        ring.verify(&parsed).await.unwrap();
    }

    #[tokio::test]
    async fn expired_and_unknown_keys_are_refused() {
        let ring = keyring();
        let now = Utc::now();
        let key = ring
            .create("secret", None, Some(now - Duration::days(2)), Some(now - Duration::days(1)))
            .await
            .unwrap();
        let token = key.generate_token("photos", ring.member_id(), "album/1.jpg");
        assert!(matches!(
            ring.verify(&params(&ring, 1, token.clone())).await,
            Err(NodeError::KeyExpired(1))
        ));
        assert!(matches!(
            ring.generate_token("photos", ring.member_id(), "album/1.jpg", Some(1)).await,
            Err(NodeError::KeyExpired(1))
        ));
        assert!(matches!(
            ring.verify(&params(&ring, 9, token)).await,
            Err(NodeError::KeyNotFound(_))
        ));
    }
}
