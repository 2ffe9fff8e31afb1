//! Network link handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use podnet_node_api::{CreateLinkRequest, LinksResponse, NetworkLink};
use uuid::Uuid;

use crate::{error::AppError, middleware::auth::Caller};

use super::AppState;

/// `POST /v1/links`
///
/// Idempotent: re-adding an existing link returns it unchanged.
pub async fn create(
    State(state): State<AppState>,
    _caller: Caller,
    Json(body): Json<CreateLinkRequest>,
) -> Result<impl IntoResponse, AppError> {
    let relation = body.relation.trim();
    if relation.is_empty() {
        return Err(AppError::BadRequest("relation must not be empty".into()));
    }
    let owner = state.identity.member_id;
    state
        .storage
        .put_link(&NetworkLink {
            owner_member_id: owner,
            target_member_id: body.target_member_id,
            relation: relation.to_string(),
            created_at: Utc::now(),
        })
        .await?;

    let link = state
        .storage
        .list_links(owner)
        .await?
        .into_iter()
        .find(|l| l.target_member_id == body.target_member_id && l.relation == relation)
        .ok_or_else(|| AppError::Internal("link vanished after insert".into()))?;
    Ok((StatusCode::CREATED, Json(link)))
}

/// `GET /v1/links`
pub async fn list(State(state): State<AppState>) -> Result<Json<LinksResponse>, AppError> {
    let items = state.storage.list_links(state.identity.member_id).await?;
    Ok(Json(LinksResponse { items }))
}

/// `DELETE /v1/links/{target}/{relation}`
pub async fn delete(
    State(state): State<AppState>,
    _caller: Caller,
    Path((target, relation)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    if state
        .storage
        .delete_link(state.identity.member_id, target, &relation)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no {relation} link to {target}")))
    }
}
