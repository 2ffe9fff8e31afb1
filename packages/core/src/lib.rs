//! Core trust model for PodNet pods.
//!
//! A pod is a small server holding one member's data for one service. Pods
//! call each other over mutually authenticated TLS, fan queries out across
//! the member's relation graph, and gate CDN access to restricted assets with
//! short-lived tokens. This crate holds the pure, I/O-free parts of that
//! model; the server lives in `podnet-node`.
//!
//! # Crate layout
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`identity`] | Principals, sealed TLS and Data secrets: [`Identity`], [`Principal`], [`SealedKey`] |
//! | [`assertion`] | Origin signatures over federated queries: [`OriginAssertion`] |
//! | [`query`] | Records, filters, and recursive queries: [`RecursiveQuery`], [`FilterSet`], [`select`] |
//! | [`content`] | Rotating content keys and CDN tokens: [`ContentKey`] |
//!
//! # Quick start
//!
//! ```rust,ignore
//! use podnet::{AssertedScope, DataSecret, OriginAssertion, RecursiveQuery};
//!
//! let secret = DataSecret::generate("passphrase")?;
//! let signing_key = secret.unlock("passphrase")?;
//!
//! let mut query = RecursiveQuery::new("photo");
//! query.depth = 2;
//! query.relations = vec!["friend".into()];
//!
//! let scope = AssertedScope {
//!     service_id: "photos",
//!     relations: &query.relations,
//!     filters: &query.filters,
//! };
//! let assertion = OriginAssertion::mint(&signing_key, member_id, scope, chrono::Utc::now())?;
//! ```

pub mod assertion;
pub mod content;
pub mod identity;
pub mod query;

pub use assertion::{AssertedScope, AssertionError, OriginAssertion, DEFAULT_MAX_AGE_SECS};
pub use content::{select_active, ContentKey, ContentTokenParams, KeyStatus, TokenError};
pub use identity::{
    DataCertificate, DataSecret, Identity, IdentityError, Principal, PrincipalKind, SealError,
    SealedKey, TlsSecret,
};
pub use query::{
    select, Comparator, FilterError, FilterSet, Predicate, QueryPage, Record, RecursiveQuery,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
