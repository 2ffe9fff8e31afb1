//! Assembles the Axum [`Router`] from all handler modules.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{content, links, members, node, query, AppState};

/// Build the complete application router with shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Discovery
        .route("/.well-known/podnet", get(node::well_known))
        // Records
        .route("/v1/classes/{class}/query", post(query::query))
        .route("/v1/classes/{class}/append", post(query::append))
        // Links
        .route("/v1/links", post(links::create).get(links::list))
        .route("/v1/links/{target}/{relation}", delete(links::delete))
        // Directory cache
        .route(
            "/v1/members/{member_id}",
            get(members::get_member).put(members::put_member),
        )
        // Content keys and tokens
        .route("/v1/content/keys", post(content::create_key))
        .route("/v1/content/keys/active", get(content::active_key))
        .route("/v1/content/token", post(content::issue_token))
        .route("/v1/content/verify", post(content::verify_token))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
