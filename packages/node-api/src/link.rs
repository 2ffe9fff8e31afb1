//! Network links — `POST|GET /v1/links`, `DELETE /v1/links/{target}/{relation}`.
//!
//! A link is a directed, labelled edge from the pod's member to another
//! member. Federated queries follow the links whose relation they name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A directed edge in a member's relation graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkLink {
    pub owner_member_id: Uuid,
    pub target_member_id: Uuid,
    /// Free-form label such as `"friend"` or `"family"`.
    pub relation: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /v1/links`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateLinkRequest {
    pub target_member_id: Uuid,
    pub relation: String,
}

/// Response body for `GET /v1/links`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinksResponse {
    pub items: Vec<NetworkLink>,
}
