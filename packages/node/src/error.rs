//! Error types for the federation layer and the HTTP surface.
//!
//! [`NodeError`] is the error taxonomy of the session pool, gateway,
//! federator, and keyring. [`AppError`] is what a handler returns; every
//! variant serialises to the [`ErrorResponse`] JSON format with a fitting
//! HTTP status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use podnet::{AssertionError, FilterError, IdentityError, TokenError};
use podnet_node_api::{error::codes, ErrorResponse};
use uuid::Uuid;

use crate::storage::StorageError;

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A secret of the wrong kind for the requested session, or a caller
    /// whose identity does not fit the operation.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    /// A fresh query arrived without a verified transport identity.
    #[error("caller identity required")]
    IdentityRequired,

    /// Timeout, refused connection, certificate failure, or HTTP status ≥400.
    #[error("call to {url} failed: {cause}")]
    RemoteCallFailed { url: String, cause: String },

    /// Stale timestamp, signature mismatch, or content mismatch on an
    /// origin assertion.
    #[error("origin assertion rejected: {0}")]
    SignatureInvalid(String),

    #[error("query {0} is already in flight or was processed")]
    DuplicateQuery(Uuid),

    #[error("malformed query: {0}")]
    FilterMalformed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("content key {0} has expired")]
    KeyExpired(u32),

    #[error("content key not found: {0}")]
    KeyNotFound(String),

    #[error("member {0} is not known")]
    MemberNotFound(Uuid),

    #[error("content token does not match")]
    TokenInvalid,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl NodeError {
    pub fn remote(url: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        NodeError::RemoteCallFailed {
            url: url.into(),
            cause: cause.to_string(),
        }
    }
}

impl From<FilterError> for NodeError {
    fn from(e: FilterError) -> Self {
        NodeError::FilterMalformed(e.to_string())
    }
}

impl From<AssertionError> for NodeError {
    fn from(e: AssertionError) -> Self {
        NodeError::SignatureInvalid(e.to_string())
    }
}

impl From<IdentityError> for NodeError {
    fn from(e: IdentityError) -> Self {
        NodeError::IdentityMismatch(e.to_string())
    }
}

impl From<TokenError> for NodeError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::KeyExpired(key_id) => NodeError::KeyExpired(key_id),
            TokenError::Mismatch | TokenError::Malformed(_) => NodeError::TokenInvalid,
        }
    }
}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// An error that a handler can return; converts directly to an HTTP response.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
    Node(NodeError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, codes::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, codes::INVALID_PARAMETER, msg),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, codes::IDENTITY_REQUIRED, msg)
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR, msg)
            }
            AppError::Node(e) => {
                let (status, code) = match &e {
                    NodeError::IdentityMismatch(_) => {
                        (StatusCode::FORBIDDEN, codes::IDENTITY_MISMATCH)
                    }
                    NodeError::IdentityRequired => {
                        (StatusCode::UNAUTHORIZED, codes::IDENTITY_REQUIRED)
                    }
                    NodeError::RemoteCallFailed { .. } => {
                        (StatusCode::BAD_GATEWAY, codes::REMOTE_CALL_FAILED)
                    }
                    NodeError::SignatureInvalid(_) => {
                        (StatusCode::UNAUTHORIZED, codes::SIGNATURE_INVALID)
                    }
                    NodeError::DuplicateQuery(_) => (StatusCode::CONFLICT, codes::DUPLICATE_QUERY),
                    NodeError::FilterMalformed(_) => {
                        (StatusCode::BAD_REQUEST, codes::FILTER_MALFORMED)
                    }
                    NodeError::InvalidInput(_) => {
                        (StatusCode::BAD_REQUEST, codes::INVALID_PARAMETER)
                    }
                    NodeError::KeyExpired(_) => (StatusCode::FORBIDDEN, codes::KEY_EXPIRED),
                    NodeError::KeyNotFound(_) | NodeError::MemberNotFound(_) => {
                        (StatusCode::NOT_FOUND, codes::NOT_FOUND)
                    }
                    NodeError::TokenInvalid => (StatusCode::UNAUTHORIZED, codes::TOKEN_INVALID),
                    NodeError::Storage(StorageError::NotFound) => {
                        (StatusCode::NOT_FOUND, codes::NOT_FOUND)
                    }
                    NodeError::Storage(StorageError::Conflict(_)) => {
                        (StatusCode::CONFLICT, codes::CONFLICT)
                    }
                    NodeError::Tls(_) | NodeError::Storage(StorageError::Internal(_)) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR)
                    }
                };
                (status, code, e.to_string())
            }
        };
        let body = ErrorResponse::new(code, message);
        (status, Json(body)).into_response()
    }
}

impl From<NodeError> for AppError {
    fn from(e: NodeError) -> Self {
        AppError::Node(e)
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        AppError::Node(NodeError::Storage(e))
    }
}

impl From<FilterError> for AppError {
    fn from(e: FilterError) -> Self {
        AppError::Node(e.into())
    }
}
