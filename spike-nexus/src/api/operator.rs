//! KEK and RMK administration endpoints.
//!
//! Restricted to the bootstrap operator role. RMK rotation is the
//! cooperative ceremony: snapshot, re-collect the re-sharded key from the
//! Keepers, rotate with the derivation self-check, validate, and roll back
//! to the snapshot on any failure.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use spike_types::api::v1::{
    CurrentKekResponse, KekListResponse, KekStatEntry, KekStatsResponse, RotateKekResponse,
    RotateRmkResponse,
};
use spike_types::auth::PeerRole;
use spike_types::error::SpikeError;
use zeroize::Zeroize as _;

use super::{NexusState, VerifiedPeer, errors::ApiError};

pub(crate) fn routes(state: NexusState) -> Router {
    Router::new()
        .route("/v1/operator/keks", get(list_keks))
        .route("/v1/operator/keks/current", get(current_kek))
        .route("/v1/operator/keks/stats", get(kek_stats))
        .route("/v1/operator/keks/rotate", post(rotate_kek))
        .route("/v1/operator/rmk/rotate", post(rotate_rmk))
        .with_state(state)
}

const OPERATOR_ROLES: &[PeerRole] = &[PeerRole::Bootstrap];

async fn list_keks(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<KekListResponse>, ApiError> {
    state.gate.authorize(&peer, OPERATOR_ROLES)?;
    let manager = state.engine.kek_manager();
    Ok(Json(KekListResponse {
        keks: manager.list_metadata().await,
        current: manager.active_kek_id().await,
    }))
}

async fn current_kek(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<CurrentKekResponse>, ApiError> {
    state.gate.authorize(&peer, OPERATOR_ROLES)?;
    let manager = state.engine.kek_manager();
    Ok(Json(CurrentKekResponse {
        current: manager.active_kek_id().await,
        rmk_version: manager.rmk_version().await,
    }))
}

async fn kek_stats(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<KekStatsResponse>, ApiError> {
    state.gate.authorize(&peer, OPERATOR_ROLES)?;
    let stats = state.engine.kek_manager().stats().await?;
    Ok(Json(KekStatsResponse {
        keks: stats
            .into_iter()
            .map(|(metadata, referencing_versions)| KekStatEntry {
                metadata,
                referencing_versions,
            })
            .collect(),
    }))
}

async fn rotate_kek(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<RotateKekResponse>, ApiError> {
    state.gate.authorize(&peer, OPERATOR_ROLES)?;
    let (previous, current) = state.engine.kek_manager().rotate_kek().await?;
    Ok(Json(RotateKekResponse { previous, current }))
}

async fn rotate_rmk(
    State(state): State<NexusState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<RotateRmkResponse>, ApiError> {
    state.gate.authorize(&peer, OPERATOR_ROLES)?;
    let manager = state.engine.kek_manager();

    let snapshot = manager.prepare_rmk_rotation().await;
    let old_version = snapshot.rmk_version;
    let mut old_rmk = manager.current_rmk().await;

    // the keepers were re-sharded by the bootstrap tooling; collect the
    // fresh shard set and reconstruct, bailing out on process shutdown
    let mut new_rmk = state
        .recovery
        .recover(&state.cancellation_token)
        .await
        .map_err(|err| {
            tracing::error!("could not re-collect shards for RMK rotation: {err:?}");
            SpikeError::CryptoRecoverFailed
        })?;

    let new_version = old_version.next();
    let rotated = manager.rotate_rmk(&old_rmk, &new_rmk, new_version).await;
    let validated = match rotated {
        Ok(()) => manager.validate_rmk_rotation().await,
        Err(err) => Err(err),
    };
    let result = match validated {
        Ok(()) => Ok(Json(RotateRmkResponse {
            old_version,
            new_version,
        })),
        Err(err) => {
            if let Err(rollback_err) = manager.rollback_rmk_rotation(&snapshot, &old_rmk).await {
                tracing::error!("RMK rotation rollback failed: {rollback_err}");
            }
            Err(err.into())
        }
    };
    old_rmk.zeroize();
    new_rmk.zeroize();
    result
}
