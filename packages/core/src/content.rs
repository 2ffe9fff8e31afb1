//! Content keys and the tokens that gate CDN access to restricted assets.
//!
//! Each member owns a sequence of [`ContentKey`]s with monotonically
//! increasing `key_id`s. A token is `hex(HMAC-SHA256(key, message))` where the
//! message is the canonical query string
//! `service_id={s}&member_id={m}&asset_id={a}` with percent-encoded values.
//! Tokens are deterministic, so a CDN edge holding the key can recompute them.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("content key {0} has expired")]
    KeyExpired(u32),
    #[error("content token does not match")]
    Mismatch,
    #[error("malformed content token: {0}")]
    Malformed(String),
}

/// Lifecycle of a key relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Inactive,
    Active,
    Expired,
}

/// One rotating per-member token key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    pub member_id: Uuid,
    pub key_id: u32,
    pub key: String,
    pub not_before: DateTime<Utc>,
    /// `None` means the key never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("member_id", &self.member_id)
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl ContentKey {
    pub fn status(&self, now: DateTime<Utc>) -> KeyStatus {
        if now < self.not_before {
            KeyStatus::Inactive
        } else if self.not_after.is_some_and(|end| now > end) {
            KeyStatus::Expired
        } else {
            KeyStatus::Active
        }
    }

    /// Derive the access token for one asset.
    pub fn generate_token(&self, service_id: &str, member_id: Uuid, asset_id: &str) -> String {
        hex::encode(self.mac(service_id, member_id, asset_id).finalize().into_bytes())
    }

    /// The `&`-joined query string appended to a CDN asset URL.
    pub fn generate_url_query_parameters(
        &self,
        service_id: &str,
        member_id: Uuid,
        asset_id: &str,
    ) -> String {
        format!(
            "{}&key_id={}&content_token={}",
            canonical_message(service_id, member_id, asset_id),
            self.key_id,
            self.generate_token(service_id, member_id, asset_id)
        )
    }

    /// Recompute the token and compare it in constant time.
    ///
    /// Only an EXPIRED key is refused; a key that is not yet active still
    /// verifies tokens it has already issued.
    pub fn verify_token(
        &self,
        service_id: &str,
        member_id: Uuid,
        asset_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        if self.status(now) == KeyStatus::Expired {
            return Err(TokenError::KeyExpired(self.key_id));
        }
        let presented = hex::decode(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        self.mac(service_id, member_id, asset_id)
            .verify_slice(&presented)
            .map_err(|_| TokenError::Mismatch)
    }

    fn mac(&self, service_id: &str, member_id: Uuid, asset_id: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(canonical_message(service_id, member_id, asset_id).as_bytes());
        mac
    }
}

/// Pick the key to issue new tokens with: the ACTIVE key with the highest id.
pub fn select_active<'a>(
    keys: impl IntoIterator<Item = &'a ContentKey>,
    now: DateTime<Utc>,
) -> Option<&'a ContentKey> {
    keys.into_iter()
        .filter(|k| k.status(now) == KeyStatus::Active)
        .max_by_key(|k| k.key_id)
}

fn canonical_message(service_id: &str, member_id: Uuid, asset_id: &str) -> String {
    format!(
        "service_id={}&member_id={}&asset_id={}",
        urlencoding::encode(service_id),
        member_id,
        urlencoding::encode(asset_id)
    )
}

// ---------------------------------------------------------------------------
// URL parameters
// ---------------------------------------------------------------------------

/// The parameters carried by a tokenised CDN URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTokenParams {
    pub service_id: String,
    pub member_id: Uuid,
    pub asset_id: String,
    pub key_id: u32,
    pub content_token: String,
}

impl ContentTokenParams {
    /// Parse a query string produced by
    /// [`ContentKey::generate_url_query_parameters`]. A leading `?` is ignored.
    pub fn parse(query: &str) -> Result<Self, TokenError> {
        let mut service_id = None;
        let mut member_id = None;
        let mut asset_id = None;
        let mut key_id = None;
        let mut content_token = None;

        for pair in query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
            let (name, raw) = pair
                .split_once('=')
                .ok_or_else(|| TokenError::Malformed(format!("parameter without value: {pair}")))?;
            let value = urlencoding::decode(raw)
                .map_err(|e| TokenError::Malformed(e.to_string()))?
                .into_owned();
            match name {
                "service_id" => service_id = Some(value),
                "member_id" => {
                    member_id = Some(
                        value
                            .parse::<Uuid>()
                            .map_err(|e| TokenError::Malformed(format!("member_id: {e}")))?,
                    )
                }
                "asset_id" => asset_id = Some(value),
                "key_id" => {
                    key_id = Some(
                        value
                            .parse::<u32>()
                            .map_err(|e| TokenError::Malformed(format!("key_id: {e}")))?,
                    )
                }
                "content_token" => content_token = Some(value),
                _ => {}
            }
        }

        let missing = |name: &str| TokenError::Malformed(format!("missing {name}"));
        Ok(Self {
            service_id: service_id.ok_or_else(|| missing("service_id"))?,
            member_id: member_id.ok_or_else(|| missing("member_id"))?,
            asset_id: asset_id.ok_or_else(|| missing("asset_id"))?,
            key_id: key_id.ok_or_else(|| missing("key_id"))?,
            content_token: content_token.ok_or_else(|| missing("content_token"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(key_id: u32, not_before: DateTime<Utc>, not_after: Option<DateTime<Utc>>) -> ContentKey {
        ContentKey {
            member_id: Uuid::now_v7(),
            key_id,
            key: format!("secret-{key_id}"),
            not_before,
            not_after,
        }
    }

    #[test]
    fn status_windows() {
        let now = Utc::now();
        let k = key(1, now, Some(now + Duration::hours(1)));
        assert_eq!(k.status(now - Duration::seconds(1)), KeyStatus::Inactive);
        assert_eq!(k.status(now), KeyStatus::Active);
        assert_eq!(k.status(now + Duration::hours(1)), KeyStatus::Active);
        assert_eq!(k.status(now + Duration::hours(2)), KeyStatus::Expired);
        assert_eq!(key(2, now, None).status(now + Duration::days(3650)), KeyStatus::Active);
    }

    #[test]
    fn tokens_are_deterministic() {
        let k = key(1, Utc::now(), None);
        let member = Uuid::now_v7();
        let a = k.generate_token("photos", member, "asset-1");
        assert_eq!(a, k.generate_token("photos", member, "asset-1"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, k.generate_token("photos", member, "asset-2"));
        assert_ne!(a, key(1, Utc::now(), None).generate_token("videos", member, "asset-1"));
    }

    #[test]
    fn known_vector() {
        let k = ContentKey {
            member_id: Uuid::nil(),
            key_id: 7,
            key: "key".into(),
            not_before: Utc::now(),
            not_after: None,
        };
        // HMAC-SHA256("key", "service_id=s&member_id=00000000-0000-0000-0000-000000000000&asset_id=a%2Fb")
        let mut mac = <HmacSha256 as Mac>::new_from_slice(b"key").unwrap();
        mac.update(b"service_id=s&member_id=00000000-0000-0000-0000-000000000000&asset_id=a%2Fb");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(k.generate_token("s", Uuid::nil(), "a/b"), expected);
    }

    #[test]
    fn url_parameters_roundtrip_through_parse() {
        let k = key(3, Utc::now(), None);
        let member = Uuid::now_v7();
        let query = k.generate_url_query_parameters("photos", member, "albums/2026 trip.jpg");
        assert!(query.starts_with("service_id=photos&member_id="));
        assert!(query.contains("&key_id=3&content_token="));

        let params = ContentTokenParams::parse(&format!("?{query}")).unwrap();
        assert_eq!(params.asset_id, "albums/2026 trip.jpg");
        assert_eq!(params.member_id, member);
        assert_eq!(params.key_id, 3);
        k.verify_token(
            &params.service_id,
            params.member_id,
            &params.asset_id,
            &params.content_token,
            Utc::now(),
        )
        .unwrap();
    }

    #[test]
    fn verify_rejects_expired_key_and_wrong_token() {
        let now = Utc::now();
        let member = Uuid::now_v7();
        let k = key(1, now - Duration::hours(2), Some(now - Duration::hours(1)));
        let token = k.generate_token("photos", member, "a");
        assert_eq!(
            k.verify_token("photos", member, "a", &token, now),
            Err(TokenError::KeyExpired(1))
        );

        let k = key(2, now, None);
        let token = k.generate_token("photos", member, "a");
        assert_eq!(
            k.verify_token("photos", member, "b", &token, now),
            Err(TokenError::Mismatch)
        );
        assert!(matches!(
            k.verify_token("photos", member, "a", "zz", now),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn inactive_key_still_verifies() {
        let now = Utc::now();
        let member = Uuid::now_v7();
        let k = key(1, now + Duration::hours(1), None);
        let token = k.generate_token("photos", member, "a");
        k.verify_token("photos", member, "a", &token, now).unwrap();
    }

    #[test]
    fn highest_active_key_wins() {
        let now = Utc::now();
        let keys = vec![
            key(1, now - Duration::days(2), None),
            key(2, now - Duration::days(1), None),
            key(3, now + Duration::days(1), None),
            key(4, now - Duration::days(3), Some(now - Duration::days(1))),
        ];
        assert_eq!(select_active(&keys, now).map(|k| k.key_id), Some(2));
        assert_eq!(select_active(&keys[2..], now), None);
    }

    #[test]
    fn debug_redacts_key() {
        let k = key(1, Utc::now(), None);
        assert!(!format!("{k:?}").contains("secret-1"));
    }
}
