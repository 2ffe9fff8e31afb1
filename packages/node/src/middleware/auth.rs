//! Caller identity extractors.
//!
//! Mutual TLS is terminated in front of the pod. The terminator verifies the
//! peer certificate and forwards the principal it names in a header
//! (`x-podnet-client` unless configured otherwise), in the compact form
//! `member:<uuid>@<service>`, `account:<uuid>` or `service:<id>`.
//!
//! - [`Caller`]: requires the header; 401 if absent.
//! - [`OptionalCaller`]: yields `None` when the header is absent.
//!
//! A header that is present but does not parse is rejected with 400 by both.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use podnet::Principal;

use crate::{error::AppError, handlers::AppState};

/// The verified principal on the other end of the TLS connection.
#[derive(Debug, Clone)]
pub struct Caller(pub Principal);

/// Like [`Caller`], but the header may be absent.
#[derive(Debug, Clone)]
pub struct OptionalCaller(pub Option<Principal>);

impl<S> FromRequestParts<S> for OptionalCaller
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);
        caller_from_parts(parts, &app_state.config.client_header).map(OptionalCaller)
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let OptionalCaller(principal) = OptionalCaller::from_request_parts(parts, state).await?;
        principal
            .map(Caller)
            .ok_or_else(|| AppError::Unauthorized("caller identity required".into()))
    }
}

pub(crate) fn caller_from_parts(
    parts: &Parts,
    header: &str,
) -> Result<Option<Principal>, AppError> {
    let Some(value) = parts.headers.get(header) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AppError::BadRequest(format!("{header} is not valid ASCII")))?;
    Principal::from_header_value(value)
        .map(Some)
        .map_err(|e| AppError::BadRequest(format!("{header}: {e}")))
}
