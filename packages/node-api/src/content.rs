//! Content keys and tokens — `/v1/content/*`.

use chrono::{DateTime, Utc};
use podnet::{ContentKey, KeyStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body for `POST /v1/content/keys`.
///
/// `key_id` defaults to one past the member's current highest id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateKeyRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

/// Public view of a content key. The key material itself is never returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentKeyInfo {
    pub member_id: Uuid,
    pub key_id: u32,
    pub not_before: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub status: KeyStatus,
}

impl ContentKeyInfo {
    pub fn from_key(key: &ContentKey, now: DateTime<Utc>) -> Self {
        Self {
            member_id: key.member_id,
            key_id: key.key_id,
            not_before: key.not_before,
            not_after: key.not_after,
            status: key.status(now),
        }
    }
}

/// Request body for `POST /v1/content/token` and `POST /v1/content/verify`.
///
/// For `verify`, the presented token travels as `Authorization: Bearer <token>`
/// and `key_id` names the key it was issued under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub service_id: String,
    pub asset_id: String,
    pub member_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub content_token: String,
    pub key_id: u32,
}
