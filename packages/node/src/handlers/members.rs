//! Member directory handlers — `GET|PUT /v1/members/{member_id}`.
//!
//! These read and seed the local cache only. A `GET` never triggers a
//! directory lookup, so a pod can itself serve as a directory.
//!
//! Cached certificates decide which origin assertions this pod accepts, so
//! only the pod's own member or its service operator may `PUT`.

use axum::{
    extract::{Path, State},
    Json,
};
use podnet_node_api::MemberInfo;
use uuid::Uuid;

use crate::{error::AppError, error::NodeError, middleware::auth::Caller};

use super::AppState;

pub async fn get_member(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
) -> Result<Json<MemberInfo>, AppError> {
    state
        .directory
        .cached(member_id)
        .await?
        .map(Json)
        .ok_or(AppError::Node(NodeError::MemberNotFound(member_id)))
}

pub async fn put_member(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(member_id): Path<Uuid>,
    Json(member): Json<MemberInfo>,
) -> Result<Json<MemberInfo>, AppError> {
    if !state.identity.administers(&caller) {
        tracing::warn!(
            "refused directory entry for {member_id} from {}",
            caller.to_header_value()
        );
        return Err(AppError::Node(NodeError::IdentityMismatch(format!(
            "{} may not seed this pod's directory",
            caller.to_header_value()
        ))));
    }
    if member.member_id != member_id {
        return Err(AppError::BadRequest(format!(
            "body names {} but path names {member_id}",
            member.member_id
        )));
    }
    member
        .data_certificate
        .verifying_key()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.directory.register(&member).await?;
    Ok(Json(member))
}
