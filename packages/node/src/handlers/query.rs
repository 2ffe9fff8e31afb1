//! Record handlers — federated query and append.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use podnet::Record;
use podnet_node_api::{AppendRequest, QueryRequest, QueryResponse};

use crate::{
    error::AppError,
    middleware::auth::{Caller, OptionalCaller},
};

use super::AppState;

/// `POST /v1/classes/{class}/query`
///
/// The class in the path wins over any `class_name` in the body. Forwarded
/// queries authenticate with their origin assertion; fresh ones need a
/// caller identity.
pub async fn query(
    State(state): State<AppState>,
    Path(class): Path<String>,
    OptionalCaller(caller): OptionalCaller,
    Json(mut request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    request.query.class_name = class;
    let response = state.federator.execute(request, caller.as_ref()).await?;
    Ok(Json(response))
}

/// `POST /v1/classes/{class}/append`
///
/// Stores a new record owned by this pod's member and returns it with its
/// assigned id.
pub async fn append(
    State(state): State<AppState>,
    Path(class): Path<String>,
    Caller(caller): Caller,
    Json(body): Json<AppendRequest>,
) -> Result<impl IntoResponse, AppError> {
    if class.is_empty() {
        return Err(AppError::BadRequest("class must not be empty".into()));
    }
    let record = Record::new(class, state.identity.member_id, body.fields);
    state.storage.append_record(&record).await?;
    tracing::debug!("append: {} {} by {caller}", record.class_name, record.id);
    Ok((StatusCode::CREATED, Json(record)))
}
