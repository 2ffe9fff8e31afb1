//! The federated query model: records, filters, and recursive queries.
//!
//! A [`RecursiveQuery`] targets one record class on one pod. Its `depth`
//! is the remaining hop budget; when it is non-zero the pod forwards the same
//! query, with `depth - 1`, to the pods of the members its owner is linked to.
//!
//! # Filters
//!
//! Filters are expressed as `field → { comparator → operand }`:
//!
//! ```json
//! { "taken_at": { "atafter": "2026-01-01T00:00:00Z" }, "album": { "at": ["trips", "family"] } }
//! ```
//!
//! | Comparator | Matches when the field value is … |
//! |------------|-----------------------------------|
//! | `eq` / `ne` | equal / not equal to the operand |
//! | `at` / `nat` | one of / none of the operand list (a scalar is a one-element list) |
//! | `before` / `after` | strictly less / greater than the operand |
//! | `atbefore` / `atafter` | less-or-equal / greater-or-equal |
//!
//! Ordering compares numbers numerically, RFC 3339 timestamps chronologically,
//! and other strings lexicographically. A repeated field key collapses to the
//! last occurrence, as JSON object decoding keeps the final value.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Default page size when `first` is absent.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound for `first`.
pub const MAX_PAGE_SIZE: u32 = 500;

// ---------------------------------------------------------------------------
// FilterError
// ---------------------------------------------------------------------------

/// A filter or query that cannot be executed as written.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unknown comparator {comparator:?} on field {field:?}")]
    UnknownComparator { field: String, comparator: String },

    #[error("filter on field {0:?} has no comparator")]
    MissingComparator(String),

    #[error("invalid operand for {comparator} on field {field:?}: {reason}")]
    InvalidOperand {
        field: String,
        comparator: Comparator,
        reason: String,
    },

    #[error("query is missing required field {0:?}")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    At,
    Nat,
    Before,
    After,
    AtBefore,
    AtAfter,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Ne => "ne",
            Comparator::At => "at",
            Comparator::Nat => "nat",
            Comparator::Before => "before",
            Comparator::After => "after",
            Comparator::AtBefore => "atbefore",
            Comparator::AtAfter => "atafter",
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(
            self,
            Comparator::Before | Comparator::After | Comparator::AtBefore | Comparator::AtAfter
        )
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Comparator::Eq),
            "ne" => Ok(Comparator::Ne),
            "at" => Ok(Comparator::At),
            "nat" => Ok(Comparator::Nat),
            "before" => Ok(Comparator::Before),
            "after" => Ok(Comparator::After),
            "atbefore" => Ok(Comparator::AtBefore),
            "atafter" => Ok(Comparator::AtAfter),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One row of a member's data, as stored by a pod and returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// UUIDv7; sorts in creation order and doubles as the pagination cursor.
    pub id: Uuid,
    pub class_name: String,
    pub owner_member_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(class_name: impl Into<String>, owner_member_id: Uuid, fields: Map<String, Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            class_name: class_name.into(),
            owner_member_id,
            created_at: Utc::now(),
            fields,
        }
    }

    /// Look up a field by name. `id`, `owner_member_id`, and `created_at`
    /// resolve to the record's own metadata.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "owner_member_id" => Some(Value::String(self.owner_member_id.to_string())),
            "created_at" => Some(Value::String(self.created_at.to_rfc3339())),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Keep only the named fields. An empty projection keeps everything.
    pub fn project(mut self, fields: &[String]) -> Self {
        if !fields.is_empty() {
            self.fields.retain(|k, _| fields.iter().any(|f| f == k));
        }
        self
    }
}

// ---------------------------------------------------------------------------
// FilterSet
// ---------------------------------------------------------------------------

/// Raw `field → { comparator → operand }` filters as they travel on the wire.
///
/// Comparators are kept as strings until [`FilterSet::compile`] so that an
/// unknown comparator is reported as a [`FilterError`] rather than a
/// deserialization failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(BTreeMap<String, BTreeMap<String, Value>>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one comparator on `field`.
    pub fn with(mut self, field: impl Into<String>, comparator: Comparator, operand: Value) -> Self {
        self.0
            .entry(field.into())
            .or_default()
            .insert(comparator.as_str().to_string(), operand);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every entry and turn it into executable predicates.
    pub fn compile(&self) -> Result<Vec<Predicate>, FilterError> {
        let mut predicates = Vec::new();
        for (field, comparators) in &self.0 {
            if comparators.is_empty() {
                return Err(FilterError::MissingComparator(field.clone()));
            }
            for (name, operand) in comparators {
                let comparator =
                    name.parse::<Comparator>()
                        .map_err(|_| FilterError::UnknownComparator {
                            field: field.clone(),
                            comparator: name.clone(),
                        })?;
                check_operand(field, comparator, operand)?;
                predicates.push(Predicate {
                    field: field.clone(),
                    comparator,
                    operand: operand.clone(),
                });
            }
        }
        Ok(predicates)
    }
}

fn check_operand(field: &str, comparator: Comparator, operand: &Value) -> Result<(), FilterError> {
    let invalid = |reason: &str| FilterError::InvalidOperand {
        field: field.to_string(),
        comparator,
        reason: reason.to_string(),
    };
    if comparator.is_ordering() && !(operand.is_string() || operand.is_number()) {
        return Err(invalid("ordering comparators need a string, timestamp, or number"));
    }
    if matches!(comparator, Comparator::At | Comparator::Nat) && operand.is_object() {
        return Err(invalid("membership comparators need a list or scalar"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// One compiled `field comparator operand` test.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub comparator: Comparator,
    pub operand: Value,
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        let value = record.field(&self.field);
        match self.comparator {
            Comparator::Eq => match &value {
                Some(v) => values_equal(v, &self.operand),
                None => self.operand.is_null(),
            },
            Comparator::Ne => match &value {
                Some(v) => !values_equal(v, &self.operand),
                None => !self.operand.is_null(),
            },
            Comparator::At => value.is_some_and(|v| self.members().any(|m| values_equal(&v, m))),
            Comparator::Nat => !value.is_some_and(|v| self.members().any(|m| values_equal(&v, m))),
            Comparator::Before => self.ordering(value).is_some_and(|o| o == Ordering::Less),
            Comparator::After => self.ordering(value).is_some_and(|o| o == Ordering::Greater),
            Comparator::AtBefore => self.ordering(value).is_some_and(|o| o != Ordering::Greater),
            Comparator::AtAfter => self.ordering(value).is_some_and(|o| o != Ordering::Less),
        }
    }

    fn members(&self) -> impl Iterator<Item = &Value> {
        match &self.operand {
            Value::Array(items) => items.iter().collect::<Vec<_>>().into_iter(),
            other => vec![other].into_iter(),
        }
    }

    fn ordering(&self, value: Option<Value>) -> Option<Ordering> {
        compare_values(&value?, &self.operand)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => compare_values(a, b).map_or(a == b, |o| o == Ordering::Equal),
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RecursiveQuery
// ---------------------------------------------------------------------------

/// A class-level query that may fan out across the owner's relation graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecursiveQuery {
    /// Client-supplied id; every hop reuses it so loops are detected.
    pub query_id: Uuid,

    /// Record class to query. Taken from the request path when absent.
    #[serde(default)]
    pub class_name: String,

    /// Remaining hops. `0` means local only.
    #[serde(default)]
    pub depth: u32,

    /// Relation labels to follow. Ignored when `remote_member_id` is set.
    #[serde(default)]
    pub relations: Vec<String>,

    /// Forward to exactly this member instead of matching relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_member_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "FilterSet::is_empty")]
    pub filters: FilterSet,

    /// Projection; empty means every field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<u32>,

    /// Cursor: the `id` of the last record seen on the previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Uuid>,

    /// Absolute deadline set by the entry pod and carried unchanged to every hop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl RecursiveQuery {
    /// A local-only query with a fresh UUIDv7 id.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            query_id: Uuid::now_v7(),
            class_name: class_name.into(),
            depth: 0,
            relations: Vec::new(),
            remote_member_id: None,
            filters: FilterSet::new(),
            fields: Vec::new(),
            first: None,
            after: None,
            deadline: None,
        }
    }

    /// Effective page size, clamped to `[1, MAX_PAGE_SIZE]`.
    pub fn page_size(&self) -> u32 {
        self.first
            .map(|f| f.clamp(1, MAX_PAGE_SIZE))
            .unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// `true` when this hop should forward the query further.
    pub fn fans_out(&self) -> bool {
        self.depth > 0 && (self.remote_member_id.is_some() || !self.relations.is_empty())
    }

    /// The same query with one less hop of budget.
    pub fn forwarded(&self) -> Self {
        Self {
            depth: self.depth.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Check the query is executable and compile its filters.
    pub fn validate(&self) -> Result<Vec<Predicate>, FilterError> {
        if self.class_name.is_empty() {
            return Err(FilterError::MissingField("class_name"));
        }
        self.filters.compile()
    }
}

// ---------------------------------------------------------------------------
// Local execution
// ---------------------------------------------------------------------------

/// One page of local query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Record>,
    /// Number of matching records across all pages.
    pub total_count: u64,
    pub has_next_page: bool,
}

/// Run `predicates` over `records` (which must be in ascending `id` order),
/// applying keyset pagination and projection.
pub fn select<'a>(
    records: impl IntoIterator<Item = &'a Record>,
    predicates: &[Predicate],
    query: &RecursiveQuery,
) -> QueryPage {
    let limit = query.page_size() as usize;
    let mut total_count = 0u64;
    let mut items = Vec::new();
    let mut has_next_page = false;

    for record in records {
        if record.class_name != query.class_name || !predicates.iter().all(|p| p.matches(record)) {
            continue;
        }
        total_count += 1;
        if query.after.is_some_and(|after| record.id <= after) {
            continue;
        }
        if items.len() < limit {
            items.push(record.clone().project(&query.fields));
        } else {
            has_next_page = true;
        }
    }

    QueryPage {
        items,
        total_count,
        has_next_page,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
