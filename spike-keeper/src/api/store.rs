//! The shard endpoints.
//!
//! - `POST /v1/store/contribute` – peers (and the bootstrap tooling) push
//!   their 32-byte entropy contributions here. 400 if the shard decodes to
//!   all zeros, 401 unless the caller is a keeper, bootstrap, or nexus.
//! - `POST /v1/store/shard` – serves this Keeper's persisted share value.
//!   404 while no share exists, 401 unless the caller is nexus.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use spike_types::api::v1::{ContributeShardRequest, ShardResponse};
use spike_types::auth::PeerRole;
use spike_types::error::SpikeError;

use super::{KeeperAppState, VerifiedPeer, errors::ApiError};
use crate::metrics::METRICS_ID_KEEPER_SHARD_SERVED;

pub(crate) fn routes(app_state: KeeperAppState) -> Router {
    Router::new()
        .route("/v1/store/contribute", post(contribute))
        .route("/v1/store/shard", post(shard))
        .with_state(app_state)
}

async fn contribute(
    State(app): State<KeeperAppState>,
    VerifiedPeer(peer): VerifiedPeer,
    Json(request): Json<ContributeShardRequest>,
) -> Result<(), ApiError> {
    app.gate.authorize(
        &peer,
        &[PeerRole::Keeper, PeerRole::Bootstrap, PeerRole::Nexus],
    )?;
    app.state
        .receive_contribution(request.keeper_id, request.shard)?;
    Ok(())
}

async fn shard(
    State(app): State<KeeperAppState>,
    VerifiedPeer(peer): VerifiedPeer,
) -> Result<Json<ShardResponse>, ApiError> {
    app.gate.authorize(&peer, &[PeerRole::Nexus])?;
    let shard = app.state.shard().ok_or(SpikeError::EntityNotFound)?;
    ::metrics::counter!(METRICS_ID_KEEPER_SHARD_SERVED).increment(1);
    Ok(Json(ShardResponse { shard }))
}
