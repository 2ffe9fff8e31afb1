//! Federated query and record append — `POST /v1/classes/{class}/query|append`.

use chrono::{DateTime, Utc};
use podnet::{OriginAssertion, Record, RecursiveQuery};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Request body for `POST /v1/classes/{class}/query`.
///
/// The query parameters sit at the top level. A forwarded query additionally
/// carries the origin assertion fields; a fresh query from a client leaves
/// them out.
///
/// ```json
/// {
///   "query_id": "0190c7a2-...",
///   "depth": 1,
///   "relations": ["friend"],
///   "filters": { "album": { "eq": "trips" } },
///   "origin_member_id": "0190c7a1-...",
///   "timestamp": "2026-03-01T10:00:00.123Z",
///   "origin_signature": "z3x..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    #[serde(flatten)]
    pub query: RecursiveQuery,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_member_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_signature: Option<String>,
}

impl QueryRequest {
    /// A fresh request with no origin assertion.
    pub fn new(query: RecursiveQuery) -> Self {
        Self {
            query,
            origin_member_id: None,
            timestamp: None,
            origin_signature: None,
        }
    }

    /// A forwarded request carrying `assertion` unchanged.
    pub fn forwarded(query: RecursiveQuery, assertion: &OriginAssertion) -> Self {
        Self {
            query,
            origin_member_id: Some(assertion.origin_member_id),
            timestamp: Some(assertion.timestamp),
            origin_signature: Some(assertion.origin_signature.clone()),
        }
    }

    /// The attached origin assertion, if any.
    ///
    /// Returns `Err` with the name of a missing field when the assertion
    /// fields are only partly present.
    pub fn assertion(&self) -> Result<Option<OriginAssertion>, &'static str> {
        match (&self.origin_member_id, &self.timestamp, &self.origin_signature) {
            (None, None, None) => Ok(None),
            (Some(origin_member_id), Some(timestamp), Some(origin_signature)) => {
                Ok(Some(OriginAssertion {
                    origin_member_id: *origin_member_id,
                    timestamp: *timestamp,
                    origin_signature: origin_signature.clone(),
                }))
            }
            (None, _, _) => Err("origin_member_id"),
            (_, None, _) => Err("timestamp"),
            (_, _, None) => Err("origin_signature"),
        }
    }
}

/// Response body for a federated query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    /// Local page followed by records gathered from other pods.
    pub items: Vec<Record>,

    /// Matching records across the local store plus every distinct remote record.
    pub total_count: u64,

    /// Pagination over the *local* results only.
    pub page_info: PageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageInfo {
    /// Pass as `after` to fetch the next local page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cursor: Option<Uuid>,
    pub has_next_page: bool,
}

/// Request body for `POST /v1/classes/{class}/append`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendRequest {
    pub fields: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fresh_request_has_no_assertion() {
        let req: QueryRequest = serde_json::from_value(json!({
            "query_id": "0190c7a2-0000-7000-8000-000000000000",
            "depth": 2,
            "relations": ["friend"],
            "filters": { "album": { "eq": "trips" } }
        }))
        .unwrap();
        assert_eq!(req.query.depth, 2);
        assert_eq!(req.query.relations, vec!["friend".to_string()]);
        assert_eq!(req.assertion(), Ok(None));
    }

    #[test]
    fn forwarded_request_carries_assertion_fields_at_top_level() {
        let assertion = OriginAssertion {
            origin_member_id: Uuid::nil(),
            timestamp: "2026-03-01T10:00:00.123Z".parse().unwrap(),
            origin_signature: "zSig".into(),
        };
        let req = QueryRequest::forwarded(RecursiveQuery::new("photo"), &assertion);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["origin_signature"], "zSig");
        assert_eq!(json["class_name"], "photo");

        let back: QueryRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.assertion(), Ok(Some(assertion)));
    }

    #[test]
    fn partial_assertion_is_reported() {
        let mut req = QueryRequest::new(RecursiveQuery::new("photo"));
        req.origin_member_id = Some(Uuid::nil());
        assert_eq!(req.assertion(), Err("timestamp"));
    }
}
