//! Standard error response body.

use serde::{Deserialize, Serialize};

/// The JSON body returned for all error responses.
///
/// ```json
/// { "error": "query 0190... is already in flight", "code": "duplicate_query" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Human-readable description of the problem.
    pub error: String,

    /// Machine-readable error code.
    ///
    /// | `code` | HTTP status |
    /// |--------|------------|
    /// | `invalid_json` | 400 |
    /// | `invalid_parameter` | 400 |
    /// | `filter_malformed` | 400 |
    /// | `signature_invalid` | 401 |
    /// | `token_invalid` | 401 |
    /// | `identity_required` | 401 |
    /// | `identity_mismatch` | 403 |
    /// | `key_expired` | 403 |
    /// | `not_found` | 404 |
    /// | `duplicate_query` | 409 |
    /// | `conflict` | 409 |
    /// | `internal_error` | 500 |
    /// | `remote_call_failed` | 502 |
    pub code: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a static code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error: error.into(),
        }
    }
}

/// Well-known error codes.
pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const INVALID_PARAMETER: &str = "invalid_parameter";
    pub const FILTER_MALFORMED: &str = "filter_malformed";
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    pub const TOKEN_INVALID: &str = "token_invalid";
    pub const IDENTITY_REQUIRED: &str = "identity_required";
    pub const IDENTITY_MISMATCH: &str = "identity_mismatch";
    pub const KEY_EXPIRED: &str = "key_expired";
    pub const NOT_FOUND: &str = "not_found";
    pub const DUPLICATE_QUERY: &str = "duplicate_query";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_CALL_FAILED: &str = "remote_call_failed";
}
