//! Mapping of core error kinds onto HTTP responses.
//!
//! The body is always the minimal `{"err": "<label>"}` tag. The gate's
//! `access_unauthorized` carries deliberately nothing else; internal
//! failures are logged server-side and collapsed to a 500.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use spike_types::api::v1::ErrorBody;
use spike_types::error::SpikeError;

/// The HTTP-facing wrapper of [`SpikeError`].
pub(crate) struct ApiError(SpikeError);

impl From<SpikeError> for ApiError {
    fn from(value: SpikeError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, label) = match &self.0 {
            SpikeError::AccessUnauthorized => (StatusCode::UNAUTHORIZED, "access_unauthorized"),
            SpikeError::EntityNotFound => (StatusCode::NOT_FOUND, "not_found"),
            SpikeError::EntityInvalid(_) => (StatusCode::BAD_REQUEST, "invalid"),
            SpikeError::StateAlreadyInitialized => {
                (StatusCode::BAD_REQUEST, "already_initialized")
            }
            other => {
                tracing::error!("request failed: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        (status, Json(ErrorBody::new(label))).into_response()
    }
}
