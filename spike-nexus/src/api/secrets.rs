//! Secret CRUD endpoints.
//!
//! All routes require a verified identity inside the trust domain; the
//! fine-grained path policies live in the external policy engine, not
//! here. Response buffers hold plaintext only for the duration of the
//! request.

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use spike_types::api::v1::{
    GetSecretRequest, GetSecretResponse, ListPathsResponse, PutSecretRequest, PutSecretResponse,
    SecretVersionsRequest,
};

use super::{NexusState, VerifiedPeer, errors::ApiError};

pub(crate) fn routes(state: NexusState) -> Router {
    Router::new()
        .route("/v1/secrets", put(put_secret))
        .route("/v1/secrets/get", post(get_secret))
        .route("/v1/secrets/delete", post(delete_secret))
        .route("/v1/secrets/undelete", post(undelete_secret))
        .route("/v1/secrets/paths", get(list_paths))
        .with_state(state)
}

async fn put_secret(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
    Json(request): Json<PutSecretRequest>,
) -> Result<Json<PutSecretResponse>, ApiError> {
    state.gate.authorize_member(&peer)?;
    let version = state
        .engine
        .store_secret(&request.path, request.values)
        .await?;
    Ok(Json(PutSecretResponse { version }))
}

async fn get_secret(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
    Json(request): Json<GetSecretRequest>,
) -> Result<Json<GetSecretResponse>, ApiError> {
    state.gate.authorize_member(&peer)?;
    let secret = state
        .engine
        .load_secret(&request.path, request.version)
        .await?;
    Ok(Json(GetSecretResponse { secret }))
}

async fn delete_secret(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
    Json(request): Json<SecretVersionsRequest>,
) -> Result<(), ApiError> {
    state.gate.authorize_member(&peer)?;
    state
        .engine
        .delete_secret(&request.path, &request.versions)
        .await?;
    Ok(())
}

async fn undelete_secret(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
    Json(request): Json<SecretVersionsRequest>,
) -> Result<(), ApiError> {
    state.gate.authorize_member(&peer)?;
    state
        .engine
        .undelete_secret(&request.path, &request.versions)
        .await?;
    Ok(())
}

async fn list_paths(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<ListPathsResponse>, ApiError> {
    state.gate.authorize_member(&peer)?;
    let keys = state.engine.list_paths().await?;
    Ok(Json(ListPathsResponse { keys }))
}
