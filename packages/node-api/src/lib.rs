//! Request and response types for the PodNet pod HTTP API.
//!
//! # Endpoints covered
//!
//! | Method | Path | Type |
//! |--------|------|------|
//! | GET | `/.well-known/podnet` | → [`PodInfo`] |
//! | POST | `/v1/classes/{class}/query` | [`QueryRequest`] → [`QueryResponse`] |
//! | POST | `/v1/classes/{class}/append` | [`AppendRequest`] → [`podnet::Record`] |
//! | POST | `/v1/links` | [`CreateLinkRequest`] → [`NetworkLink`] |
//! | GET | `/v1/links` | → [`LinksResponse`] |
//! | DELETE | `/v1/links/{target}/{relation}` | → `204` |
//! | GET, PUT | `/v1/members/{member_id}` | [`MemberInfo`] |
//! | POST | `/v1/content/keys` | [`CreateKeyRequest`] → [`ContentKeyInfo`] |
//! | GET | `/v1/content/keys/active` | → [`ContentKeyInfo`] |
//! | POST | `/v1/content/token` | [`TokenRequest`] → [`TokenResponse`] |
//! | POST | `/v1/content/verify` | [`TokenRequest`] + bearer → [`TokenResponse`] |

pub mod content;
pub mod error;
pub mod link;
pub mod member;
pub mod node;
pub mod query;

pub use content::{ContentKeyInfo, CreateKeyRequest, TokenRequest, TokenResponse};
pub use error::ErrorResponse;
pub use link::{CreateLinkRequest, LinksResponse, NetworkLink};
pub use member::MemberInfo;
pub use node::PodInfo;
pub use query::{AppendRequest, PageInfo, QueryRequest, QueryResponse};
