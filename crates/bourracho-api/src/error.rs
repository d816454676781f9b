use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use bourracho_sync::SyncError;
use bourracho_types::api::ErrorResponse;

/// HTTP face of a [`SyncError`].
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SyncError::Forbidden(_) => StatusCode::FORBIDDEN,
            SyncError::Locked | SyncError::NotLocked | SyncError::AlreadyMember => {
                StatusCode::CONFLICT
            }
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage details stay in the logs.
        let message = match &self.0 {
            SyncError::Storage(e) => {
                error!("Request failed on storage: {:#}", e);
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorResponse {
            error: message,
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
