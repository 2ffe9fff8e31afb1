//! Public surface for the `podnet-node` crate.
//!
//! Exposes the router builder, application state, and the federation layer
//! so that external crates (the conformance suite, `podctl`) can run an
//! in-process pod or make calls the way a pod does.

pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod federation;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod keyring;
pub mod middleware;
pub mod router;
pub mod session_pool;
pub mod storage;

pub use config::NodeConfig;
pub use error::NodeError;
pub use gateway::{ApiGateway, ApiRequest, ApiResponse};
pub use handlers::AppState;
pub use identity::{ClientCredential, PodIdentity};
pub use router::build_router;
pub use session_pool::{SessionPool, TrustSettings};
pub use storage::{memory::MemoryStorage, Storage};
