//! API module for the Keeper service.
//!
//! This module defines all HTTP endpoints a Keeper serves and organizes
//! them into submodules:
//!
//! - [`health`] – health endpoint (`/health`).
//! - [`store`] – the shard endpoints (`/v1/store/contribute`,
//!   `/v1/store/shard`).
//!
//! Every handler first extracts the [`VerifiedPeer`]: the SPIFFE identity
//! the transport layer verified, either injected as a request extension by
//! the hosting mTLS server or carried in the `x-spike-peer-id` header by a
//! terminating proxy. The identity is the sole authentication input; there
//! are no bearer tokens.

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRequestParts;
use http::request::Parts;
use spike_types::api::PEER_IDENTITY_HEADER;
use spike_types::auth::{PeerGate, PeerIdentity};
use spike_types::error::SpikeError;
use tower_http::trace::TraceLayer;

use crate::services::keeper_state::KeeperState;

pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod store;

/// Shared state of all Keeper routes.
#[derive(Clone)]
pub(crate) struct KeeperAppState {
    pub(crate) state: KeeperState,
    pub(crate) gate: Arc<PeerGate>,
}

/// The verified peer identity of a request.
pub(crate) struct VerifiedPeer(pub(crate) PeerIdentity);

impl<S: Send + Sync> FromRequestParts<S> for VerifiedPeer {
    type Rejection = errors::ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<PeerIdentity>() {
            return Ok(Self(identity.clone()));
        }
        parts
            .headers
            .get(&PEER_IDENTITY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| Self(PeerIdentity::new(value)))
            .ok_or_else(|| SpikeError::AccessUnauthorized.into())
    }
}

/// Builds the main API router for the Keeper service.
pub(crate) fn routes(app_state: KeeperAppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(store::routes(app_state))
        .layer(TraceLayer::new_for_http())
}
