//! Origin assertions: proof that a federated query was issued by its origin member.
//!
//! The pod that first fans a query out signs the parts of the query that
//! decide *what* is shared (service, relations, and filters) together with its
//! member id and a timestamp. Every later hop forwards the assertion untouched
//! and re-verifies it against the query it actually received, so an
//! intermediate pod cannot widen the relation set or loosen a filter.
//!
//! The signed payload is the RFC 8785 (JCS) canonical form of:
//!
//! ```json
//! { "filters": {..}, "origin_member_id": "..", "relations": [..],
//!   "service_id": "..", "timestamp": "2026-03-01T10:00:00.123Z" }
//! ```
//!
//! `relations` keeps the order the origin sent. The signature is Ed25519,
//! encoded as multibase base58btc (`z` prefix).

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{DataCertificate, IdentityError};
use crate::query::FilterSet;

/// Default accepted clock skew, in seconds, either side of `now`.
pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq)]
pub enum AssertionError {
    #[error("assertion timestamp {timestamp} is outside the {max_age_secs}s window")]
    Stale {
        timestamp: DateTime<Utc>,
        max_age_secs: i64,
    },
    #[error("origin signature does not match the presented query")]
    SignatureMismatch,
    #[error("signature decoding failed: {0}")]
    Decoding(String),
    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
    #[error("origin certificate is unusable: {0}")]
    Certificate(String),
}

impl From<IdentityError> for AssertionError {
    fn from(e: IdentityError) -> Self {
        AssertionError::Certificate(e.to_string())
    }
}

/// The shareable scope of a query, as covered by the origin signature.
#[derive(Debug, Clone, Copy)]
pub struct AssertedScope<'a> {
    pub service_id: &'a str,
    pub relations: &'a [String],
    pub filters: &'a FilterSet,
}

#[derive(Serialize)]
struct CanonicalAssertion<'a> {
    origin_member_id: Uuid,
    service_id: &'a str,
    relations: &'a [String],
    filters: &'a FilterSet,
    timestamp: String,
}

/// A signed, immutable statement that `origin_member_id` issued a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginAssertion {
    pub origin_member_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub origin_signature: String,
}

impl OriginAssertion {
    /// Sign `scope` as `origin_member_id` at `now`.
    ///
    /// The timestamp is truncated to millisecond precision so the value
    /// survives the wire unchanged.
    pub fn mint(
        signing_key: &SigningKey,
        origin_member_id: Uuid,
        scope: AssertedScope<'_>,
        now: DateTime<Utc>,
    ) -> Result<Self, AssertionError> {
        let timestamp = now.trunc_subsecs(3);
        let payload = canonical_payload(origin_member_id, scope, timestamp)?;
        let signature = signing_key.sign(&payload);
        Ok(Self {
            origin_member_id,
            timestamp,
            origin_signature: format!("z{}", bs58::encode(signature.to_bytes()).into_string()),
        })
    }

    /// Check the assertion against the scope this hop received.
    ///
    /// # Errors
    ///
    /// - [`AssertionError::Stale`] if `|now - timestamp|` exceeds `max_age`.
    /// - [`AssertionError::SignatureMismatch`] if any asserted field differs.
    /// - [`AssertionError::Decoding`] / [`AssertionError::Certificate`] for
    ///   malformed signature or key material.
    pub fn verify(
        &self,
        certificate: &DataCertificate,
        scope: AssertedScope<'_>,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<(), AssertionError> {
        if (now - self.timestamp).abs() > max_age {
            return Err(AssertionError::Stale {
                timestamp: self.timestamp,
                max_age_secs: max_age.num_seconds(),
            });
        }

        let verifying_key = certificate.verifying_key()?;
        let payload = canonical_payload(self.origin_member_id, scope, self.timestamp)?;

        let sig_data = self
            .origin_signature
            .strip_prefix('z')
            .ok_or_else(|| AssertionError::Decoding("signature must start with 'z'".into()))?;
        let sig_bytes: [u8; 64] = bs58::decode(sig_data)
            .into_vec()
            .map_err(|e| AssertionError::Decoding(format!("bs58 decode failed: {e}")))?
            .try_into()
            .map_err(|_| AssertionError::Decoding("signature must be exactly 64 bytes".into()))?;

        verifying_key
            .verify(&payload, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| AssertionError::SignatureMismatch)
    }
}

fn canonical_payload(
    origin_member_id: Uuid,
    scope: AssertedScope<'_>,
    timestamp: DateTime<Utc>,
) -> Result<Vec<u8>, AssertionError> {
    let canonical = CanonicalAssertion {
        origin_member_id,
        service_id: scope.service_id,
        relations: scope.relations,
        filters: scope.filters,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    serde_jcs::to_vec(&canonical).map_err(|e| AssertionError::Canonicalization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
