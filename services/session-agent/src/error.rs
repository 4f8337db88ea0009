//! HTTP mapping for session errors
//!
//! Handlers return `ApiError`; the status code is derived from the session
//! error's class and the body is `{ "error": message, "retryable": bool }`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use identity::codes;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] session::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use session::Error as E;
        match self {
            ApiError::Session(err) => match err {
                E::NotInitialized | E::InitializationFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
                E::LoginAlreadyInProgress | E::InteractionInProgress(_) => StatusCode::CONFLICT,
                E::Config(_) => StatusCode::BAD_REQUEST,
                E::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                E::Provider(e) if e.code() == codes::STATE_MISMATCH => StatusCode::BAD_REQUEST,
                E::Provider(_) => StatusCode::BAD_GATEWAY,
                e if e.requires_login() => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ApiError::Session(err) => err.is_retryable(),
            ApiError::Internal(_) => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.retryable(),
        });
        (status, Json(body)).into_response()
    }
}
