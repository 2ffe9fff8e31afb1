//! The pod's own identity: who it speaks for and what it signs with.
//!
//! A pod holds one member's data for one service. It carries:
//!
//! - the member's Data signing key, used to mint origin assertions, and the
//!   matching public [`DataCertificate`] published at `/.well-known/podnet`;
//! - optionally, a [`ClientCredential`] (TLS secret plus the passphrase that
//!   opens it) presented to other pods for mutual TLS.
//!
//! A production pod loads both from a sealed identity document. Tests and
//! ephemeral pods generate a throwaway Data key and run without a client
//! credential, relying on the TLS terminator to authenticate the transport.

use std::fmt;
use std::path::Path;

use ed25519_dalek::SigningKey;
use podnet::{DataCertificate, Identity, IdentityError, Principal, SealError, TlsSecret};
use rand::rngs::OsRng;
use uuid::Uuid;
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// ClientCredential
// ---------------------------------------------------------------------------

/// A TLS secret and the passphrase that unseals its key.
///
/// The passphrase is wiped on drop and never printed.
pub struct ClientCredential {
    principal: Principal,
    tls: TlsSecret,
    passphrase: Zeroizing<String>,
}

impl ClientCredential {
    pub fn new(principal: Principal, tls: TlsSecret, passphrase: impl Into<String>) -> Self {
        Self {
            principal,
            tls,
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Run `load` over the combined certificate + decrypted key PEM. The key
    /// does not outlive the call.
    pub fn with_identity_pem<T>(&self, load: impl FnOnce(&[u8]) -> T) -> Result<T, SealError> {
        self.tls.with_identity_pem(&self.passphrase, load)
    }
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// PodIdentity
// ---------------------------------------------------------------------------

/// The member a pod speaks for, with its unlocked Data signing key.
pub struct PodIdentity {
    pub member_id: Uuid,
    pub service_id: String,
    pub certificate: DataCertificate,
    pub client: Option<ClientCredential>,
    signing_key: SigningKey,
}

impl PodIdentity {
    /// A fresh Data key and no client credential.
    pub fn ephemeral(member_id: Uuid, service_id: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            member_id,
            service_id: service_id.into(),
            certificate: DataCertificate::from_verifying_key(&signing_key.verifying_key()),
            client: None,
            signing_key,
        }
    }

    /// Unlock a sealed identity document. The principal must be a member.
    pub fn unlock(identity: Identity, passphrase: &str) -> Result<Self, IdentityError> {
        let Principal::Member {
            member_id,
            ref service_id,
        } = identity.principal
        else {
            return Err(IdentityError::Mismatch(format!(
                "a pod runs as a member, not {}",
                identity.principal.kind()
            )));
        };
        let service_id = service_id.clone();
        let signing_key = identity.data.unlock(passphrase)?;
        Ok(Self {
            member_id,
            service_id,
            certificate: identity.data.certificate.clone(),
            client: Some(ClientCredential::new(
                identity.principal,
                identity.tls,
                passphrase,
            )),
            signing_key,
        })
    }

    /// Read and unlock the identity document at `path`.
    pub fn load(path: &Path, passphrase: &str) -> Result<Self, IdentityError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            IdentityError::Malformed(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::unlock(Identity::from_json(&json)?, passphrase)
    }

    pub fn principal(&self) -> Principal {
        Principal::Member {
            member_id: self.member_id,
            service_id: self.service_id.clone(),
        }
    }

    /// `true` for the pod's own member and for its service operator.
    pub fn administers(&self, caller: &Principal) -> bool {
        match caller {
            Principal::Member {
                member_id,
                service_id,
            } => *member_id == self.member_id && *service_id == self.service_id,
            Principal::Service { service_id } => *service_id == self.service_id,
            Principal::Account { .. } => false,
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodIdentity")
            .field("member_id", &self.member_id)
            .field("service_id", &self.service_id)
            .field("certificate", &self.certificate)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
