//! API module for the Nexus service.
//!
//! This module defines all HTTP endpoints Nexus serves and organizes them
//! into submodules:
//!
//! - [`health`] – health endpoint (`/health`).
//! - [`secrets`] – secret CRUD by path (`/v1/secrets`, ...).
//! - [`operator`] – KEK and RMK administration (`/v1/operator/...`).
//!
//! Every handler first extracts the [`VerifiedPeer`]: the SPIFFE identity
//! the transport layer verified, either injected as a request extension by
//! the hosting mTLS server or carried in the `x-spike-peer-id` header by a
//! terminating proxy. The identity is the sole authentication input; there
//! are no bearer tokens.

use axum::Router;
use axum::extract::FromRequestParts;
use http::request::Parts;
use spike_types::api::PEER_IDENTITY_HEADER;
use spike_types::auth::{PeerGate, PeerIdentity};
use spike_types::error::SpikeError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::services::engine::SecretEngine;
use crate::services::recovery::RecoveryPeers;

pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod operator;
pub(crate) mod secrets;

/// Shared state of all Nexus routes.
#[derive(Clone)]
pub(crate) struct NexusState {
    pub(crate) engine: SecretEngine,
    pub(crate) gate: Arc<PeerGate>,
    pub(crate) recovery: Arc<RecoveryPeers>,
    /// The service shutdown token; long-running handlers race against it.
    pub(crate) cancellation_token: CancellationToken,
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

/// Builds the main API router for the Nexus service.
pub(crate) fn routes(state: NexusState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(secrets::routes(state.clone()))
        .merge(operator::routes(state))
        .layer(TraceLayer::new_for_http())
}
