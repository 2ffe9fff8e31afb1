//! Principal identities and the secrets they own.
//!
//! Every principal (account, member, or service) holds two independent
//! secrets:
//!
//! - a **TLS secret** (X.509 certificate + private key, PEM) used only to
//!   authenticate the transport, and
//! - a **Data secret** (Ed25519 keypair) used only to sign and verify payload
//!   provenance such as [`crate::OriginAssertion`]s.
//!
//! Private key material is never stored in the clear. It is sealed with a
//! key derived from an operator passphrase (Argon2id) and encrypted with
//! ChaCha20-Poly1305; opening it yields a [`Zeroizing`] buffer that wipes
//! itself on drop.
//!
//! # Data certificate encoding
//!
//! The public half of a Data secret is published as a multibase string:
//!
//! ```text
//! z <base58btc( [0xed, 0x01] ++ public_key_bytes )>
//! ```
//!
//! where `[0xed, 0x01]` is the unsigned-varint `ed25519-pub` multicodec.

use std::fmt;
use std::str::FromStr;

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned when sealing or opening private key material.
#[derive(Debug, Error, PartialEq)]
pub enum SealError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encryption,
    /// Wrong passphrase or tampered ciphertext.
    #[error("decryption failed")]
    Decryption,
    #[error("sealed key is malformed: {0}")]
    Malformed(String),
}

/// Errors returned by the identity model.
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    /// A secret of the wrong kind was supplied, or the kind is unknown.
    #[error("identity mismatch: {0}")]
    Mismatch(String),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error("invalid data certificate: {0}")]
    InvalidCertificate(String),
    #[error("malformed identity document: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The kind of a principal, without its identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    Account,
    Member,
    Service,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalKind::Account => write!(f, "account"),
            PrincipalKind::Member => write!(f, "member"),
            PrincipalKind::Service => write!(f, "service"),
        }
    }
}

impl FromStr for PrincipalKind {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(PrincipalKind::Account),
            "member" => Ok(PrincipalKind::Member),
            "service" => Ok(PrincipalKind::Service),
            other => Err(IdentityError::Mismatch(format!(
                "unknown principal kind {other:?}; expected account, member, or service"
            ))),
        }
    }
}

/// An account, a member (one account's participation in one service), or a
/// service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    Account { account_id: Uuid },
    Member { member_id: Uuid, service_id: String },
    Service { service_id: String },
}

impl Principal {
    pub fn kind(&self) -> PrincipalKind {
        match self {
            Principal::Account { .. } => PrincipalKind::Account,
            Principal::Member { .. } => PrincipalKind::Member,
            Principal::Service { .. } => PrincipalKind::Service,
        }
    }

    /// The member id, if this principal is a member.
    pub fn member_id(&self) -> Option<Uuid> {
        match self {
            Principal::Member { member_id, .. } => Some(*member_id),
            _ => None,
        }
    }

    /// Compact form used in the client-identity header forwarded by the TLS
    /// terminator: `account:<uuid>`, `member:<uuid>@<service>`, `service:<id>`.
    pub fn to_header_value(&self) -> String {
        match self {
            Principal::Account { account_id } => format!("account:{account_id}"),
            Principal::Member {
                member_id,
                service_id,
            } => format!("member:{member_id}@{service_id}"),
            Principal::Service { service_id } => format!("service:{service_id}"),
        }
    }

    /// Parse the compact header form produced by [`Principal::to_header_value`].
    pub fn from_header_value(value: &str) -> Result<Self, IdentityError> {
        let (kind, rest) = value
            .split_once(':')
            .ok_or_else(|| IdentityError::Malformed(format!("expected kind:id, got {value:?}")))?;
        let parse_uuid = |s: &str| {
            Uuid::parse_str(s).map_err(|e| IdentityError::Malformed(format!("invalid id {s:?}: {e}")))
        };
        match kind.parse::<PrincipalKind>()? {
            PrincipalKind::Account => Ok(Principal::Account {
                account_id: parse_uuid(rest)?,
            }),
            PrincipalKind::Member => {
                let (id, service_id) = rest.split_once('@').ok_or_else(|| {
                    IdentityError::Malformed("member identity must be member:<uuid>@<service>".into())
                })?;
                Ok(Principal::Member {
                    member_id: parse_uuid(id)?,
                    service_id: service_id.to_string(),
                })
            }
            PrincipalKind::Service => Ok(Principal::Service {
                service_id: rest.to_string(),
            }),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

// ---------------------------------------------------------------------------
// SealedKey
// ---------------------------------------------------------------------------

/// Private key material encrypted under a passphrase-derived key.
///
/// All three parts are hex-encoded so the sealed form embeds cleanly in JSON.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedKey").finish_non_exhaustive()
    }
}

impl SealedKey {
    /// Encrypt `plaintext` under a key derived from `passphrase`.
    pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<Self, SealError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Encryption)?;

        Ok(Self {
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt the sealed material. The returned buffer is wiped on drop.
    pub fn open(&self, passphrase: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
        let salt = hex::decode(&self.salt).map_err(|e| SealError::Malformed(format!("salt: {e}")))?;
        let nonce =
            hex::decode(&self.nonce).map_err(|e| SealError::Malformed(format!("nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(SealError::Malformed(format!("nonce must be {NONCE_LEN} bytes")));
        }
        let ciphertext = hex::decode(&self.ciphertext)
            .map_err(|e| SealError::Malformed(format!("ciphertext: {e}")))?;

        let key = derive_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| SealError::Decryption)
    }
}

/// Argon2id with the crate defaults, 32-byte output.
fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| SealError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

// ---------------------------------------------------------------------------
// TLS secret
// ---------------------------------------------------------------------------

/// Certificate and sealed private key used for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSecret {
    /// PEM-encoded certificate chain, leaf first.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key, sealed.
    pub key: SealedKey,
}

impl TlsSecret {
    /// Seal `key_pem` under `passphrase` alongside the public certificate.
    pub fn new(cert_pem: impl Into<String>, key_pem: &[u8], passphrase: &str) -> Result<Self, SealError> {
        Ok(Self {
            cert_pem: cert_pem.into(),
            key: SealedKey::seal(key_pem, passphrase)?,
        })
    }

    /// Run `load` over a combined `cert + key` PEM buffer.
    ///
    /// The decrypted key exists only for the duration of the closure and is
    /// wiped before this function returns.
    pub fn with_identity_pem<T>(
        &self,
        passphrase: &str,
        load: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, SealError> {
        let key_pem = self.key.open(passphrase)?;
        let mut combined = Zeroizing::new(Vec::with_capacity(self.cert_pem.len() + key_pem.len() + 1));
        combined.extend_from_slice(self.cert_pem.as_bytes());
        if !self.cert_pem.ends_with('\n') {
            combined.push(b'\n');
        }
        combined.extend_from_slice(&key_pem);
        Ok(load(&combined))
    }
}

// ---------------------------------------------------------------------------
// Data secret
// ---------------------------------------------------------------------------

/// The public half of a principal's Data secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCertificate {
    /// Multibase (`z` + base58btc) Ed25519 public key with multicodec prefix.
    pub public_key: String,
}

impl DataCertificate {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut bytes = ED25519_MULTICODEC.to_vec();
        bytes.extend_from_slice(key.as_bytes());
        Self {
            public_key: format!("z{}", bs58::encode(&bytes).into_string()),
        }
    }

    /// Decode the embedded Ed25519 verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let b58 = self
            .public_key
            .strip_prefix('z')
            .ok_or_else(|| IdentityError::InvalidCertificate("multibase must start with 'z'".into()))?;
        let decoded = bs58::decode(b58)
            .into_vec()
            .map_err(|e| IdentityError::InvalidCertificate(format!("base58 decode failed: {e}")))?;
        if decoded.len() < 2 || decoded[..2] != ED25519_MULTICODEC {
            return Err(IdentityError::InvalidCertificate(
                "missing ed25519 multicodec prefix [0xed, 0x01]".into(),
            ));
        }
        let key_bytes: [u8; 32] = decoded[2..]
            .try_into()
            .map_err(|_| IdentityError::InvalidCertificate("key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| IdentityError::InvalidCertificate(format!("invalid Ed25519 key: {e}")))
    }
}

/// Ed25519 keypair whose seed is sealed at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSecret {
    pub certificate: DataCertificate,
    pub seed: SealedKey,
}

impl DataSecret {
    /// Generate a fresh keypair and seal its seed under `passphrase`.
    pub fn generate(passphrase: &str) -> Result<Self, SealError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        Ok(Self {
            certificate: DataCertificate::from_verifying_key(&signing_key.verifying_key()),
            seed: SealedKey::seal(&signing_key.to_bytes(), passphrase)?,
        })
    }

    /// Open the seed and rebuild the signing key.
    ///
    /// Fails with [`IdentityError::Mismatch`] if the seed does not belong to
    /// the published certificate.
    pub fn unlock(&self, passphrase: &str) -> Result<SigningKey, IdentityError> {
        let seed = self.seed.open(passphrase)?;
        let bytes: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Malformed("data seed must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        if signing_key.verifying_key() != self.certificate.verifying_key()? {
            return Err(IdentityError::Mismatch(
                "data seed does not match the published certificate".into(),
            ));
        }
        Ok(signing_key)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A principal together with its sealed TLS and Data secrets.
///
/// This is the on-disk identity document format (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: Principal,
    pub tls: TlsSecret,
    pub data: DataSecret,
}

impl Identity {
    /// Provision a new identity from an issued TLS certificate and key,
    /// generating a fresh Data secret.
    pub fn provision(
        principal: Principal,
        tls_cert_pem: impl Into<String>,
        tls_key_pem: &[u8],
        passphrase: &str,
    ) -> Result<Self, IdentityError> {
        Ok(Self {
            principal,
            tls: TlsSecret::new(tls_cert_pem, tls_key_pem, passphrase)?,
            data: DataSecret::generate(passphrase)?,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, IdentityError> {
        serde_json::from_str(json).map_err(|e| IdentityError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, IdentityError> {
        serde_json::to_string_pretty(self).map_err(|e| IdentityError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
