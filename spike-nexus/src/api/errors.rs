//! Mapping of core error kinds onto HTTP responses.
//!
//! The body is always the minimal `{"err": "<label>"}` tag; anything more
//! would leak detail to callers the propagation policy keeps server-side.
//! Internal failures are logged with full context before being collapsed
//! to a 500.

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

fn label(err: &SpikeError) -> &'static str {
    match err {
        SpikeError::AccessUnauthorized => "access_unauthorized",
        SpikeError::EntityNotFound => "not_found",
        SpikeError::EntityInvalid(_) => "invalid",
        SpikeError::EntityLoadFailed(_) => "load_failed",
        SpikeError::EntityQueryFailed(_) => "query_failed",
        SpikeError::DataMarshalFailure(_) => "marshal_failure",
        SpikeError::DataUnmarshalFailure(_) => "unmarshal_failure",
        SpikeError::CryptoNonceGenerationFailed
        | SpikeError::CryptoNonceSizeMismatch { .. }
        | SpikeError::CryptoEncryptionFailed
        | SpikeError::CryptoDecryptionFailed
        | SpikeError::CryptoRecoverFailed => "crypto_failure",
        SpikeError::StateAlreadyInitialized => "already_initialized",
        SpikeError::StateIntegrityCheck(_) => "integrity_check",
        SpikeError::StoreCloseFailed(_)
        | SpikeError::TransactionBeginFailed(_)
        | SpikeError::TransactionCommitFailed(_)
        | SpikeError::TransactionRollbackFailed(_)
        | SpikeError::FsDirectoryCreationFailed(_)
        | SpikeError::FsFileOpenFailed(_)
        | SpikeError::FsFileCloseFailed(_) => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SpikeError::AccessUnauthorized => StatusCode::UNAUTHORIZED,
            SpikeError::EntityNotFound => StatusCode::NOT_FOUND,
            SpikeError::EntityInvalid(_) | SpikeError::StateAlreadyInitialized => {
                StatusCode::BAD_REQUEST
            }
            other => {
                tracing::error!("request failed: {other}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody::new(label(&self.0)))).into_response()
    }
}
