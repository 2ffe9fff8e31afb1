//! Content key and token handlers.
//!
//! Keys belong to the pod's member. Tokens are HMAC values bound to one
//! asset; CDN edges present them back to `POST /v1/content/verify` as a
//! bearer credential.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use podnet::ContentTokenParams;
use podnet_node_api::{ContentKeyInfo, CreateKeyRequest, TokenRequest, TokenResponse};

use crate::{error::AppError, error::NodeError, middleware::auth::Caller};

use super::AppState;

/// `POST /v1/content/keys`
pub async fn create_key(
    State(state): State<AppState>,
    _caller: Caller,
    Json(body): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let key = state
        .keyring
        .create(body.key, body.key_id, body.not_before, body.not_after)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ContentKeyInfo::from_key(&key, Utc::now())),
    ))
}

/// `GET /v1/content/keys/active`
pub async fn active_key(State(state): State<AppState>) -> Result<Json<ContentKeyInfo>, AppError> {
    let key = state.keyring.get_active_content_key().await?;
    Ok(Json(ContentKeyInfo::from_key(&key, Utc::now())))
}

/// `POST /v1/content/token`
///
/// Issues with `key_id` when given, otherwise with the active key.
pub async fn issue_token(
    State(state): State<AppState>,
    _caller: Caller,
    Json(body): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let (content_token, key_id) = state
        .keyring
        .generate_token(&body.service_id, body.member_id, &body.asset_id, body.key_id)
        .await?;
    Ok(Json(TokenResponse {
        content_token,
        key_id,
    }))
}

/// `POST /v1/content/verify`
///
/// The token travels as `Authorization: Bearer <token>`; the body names the
/// asset and the key that issued it.
pub async fn verify_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let content_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Node(NodeError::TokenInvalid))?
        .to_string();
    let key_id = body
        .key_id
        .ok_or_else(|| AppError::BadRequest("key_id is required".into()))?;

    state
        .keyring
        .verify(&ContentTokenParams {
            service_id: body.service_id,
            member_id: body.member_id,
            asset_id: body.asset_id,
            key_id,
            content_token: content_token.clone(),
        })
        .await?;
    Ok(Json(TokenResponse {
        content_token,
        key_id,
    }))
}
