//! Pod discovery — `GET /.well-known/podnet`.

use podnet::DataCertificate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The response body for `GET /.well-known/podnet`.
///
/// ```json
/// {
///   "protocol_version": "1.0",
///   "member_id": "0190c7a2-...",
///   "service_id": "photos",
///   "api_base": "https://0190c7a2.pods.example.net",
///   "data_certificate": { "public_key": "z6Mk..." },
///   "max_depth": 3
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodInfo {
    pub protocol_version: String,

    /// The member whose data this pod holds.
    pub member_id: Uuid,

    pub service_id: String,

    /// Public base URL of this pod.
    pub api_base: String,

    /// Public half of the member's Data secret, used to verify origin assertions.
    pub data_certificate: DataCertificate,

    /// Largest `depth` this pod will honour; deeper queries are clamped.
    pub max_depth: u32,
}

impl PodInfo {
    pub const PROTOCOL_VERSION: &'static str = "1.0";
}
