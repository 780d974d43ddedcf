//! HTTP translation for the request surface. Component errors classify
//! into `CoreError` first; only that classification maps to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::discovery::DiscoveryError;
use crate::error::CoreError;
use crate::guide::GuideError;
use crate::live::LiveError;
use crate::store::StoreError;
use crate::sync::SyncError;
use crate::transcode::TranscodeError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            status: self.status.as_u16(),
        });
        (self.status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::NoTunersAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => {
                tracing::error!(error = %err, "internal failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            CoreError::UpstreamUnavailable(_)
            | CoreError::UpstreamUnreachable(_)
            | CoreError::DrmProtected(_)
            | CoreError::TranscodeStartupTimeout(_)
            | CoreError::TranscoderFailed(_)
            | CoreError::AuthExpired(_) => {
                tracing::warn!(error = %err, "request failed upstream");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<TranscodeError> for ApiError {
    fn from(err: TranscodeError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<LiveError> for ApiError {
    fn from(err: LiveError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<GuideError> for ApiError {
    fn from(err: GuideError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        CoreError::from(err).into()
    }
}
