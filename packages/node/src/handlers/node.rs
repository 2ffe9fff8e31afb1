//! Pod discovery handler — `GET /.well-known/podnet`.

use axum::{extract::State, Json};
use podnet_node_api::PodInfo;

use super::AppState;

/// `GET /.well-known/podnet`
///
/// Names the member this pod serves and publishes the Data certificate that
/// other pods use to check origin assertions minted here.
pub async fn well_known(State(state): State<AppState>) -> Json<PodInfo> {
    let identity = &state.identity;
    Json(PodInfo {
        protocol_version: PodInfo::PROTOCOL_VERSION.into(),
        member_id: identity.member_id,
        service_id: identity.service_id.clone(),
        api_base: state.config.api_base.clone(),
        data_certificate: identity.certificate.clone(),
        max_depth: state.config.max_depth,
    })
}
