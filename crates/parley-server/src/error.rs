use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::SharedError;
use parley_store::StoreError;

use crate::identity::IdentityError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] IdentityError),

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable error kind, part of every error response.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::InvalidCredential(_) => "invalid_credential",
            ServerError::StoreUnavailable(_) => "store_unavailable",
            ServerError::BadRequest(_) => "bad_request",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::ConnectionClosed(_) => "connection_closed",
            ServerError::Internal(_) => "internal",
        }
    }
}

impl From<SharedError> for ServerError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Serialization(e) => ServerError::Internal(e),
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ServerError {
    fn from(rejection: QueryRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ServerError {
    fn from(rejection: PathRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::InvalidCredential(_) => {
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            ServerError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Message store unavailable".to_string(),
            ),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::ConnectionClosed(_) => (StatusCode::GONE, self.to_string()),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        match status {
            StatusCode::UNAUTHORIZED => tracing::debug!(error = %self, "Rejected request"),
            s if s.is_server_error() => tracing::error!(error = %self, "Request failed"),
            _ => {}
        }

        let body = serde_json::json!({
            "error": message,
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}
