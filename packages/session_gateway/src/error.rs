use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::sharing::JoinRejection;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session is gone")]
    SessionGone,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("guest not found")]
    GuestNotFound,

    #[error("update {0} is no longer cached")]
    UpdateExpired(u64),

    #[error("join rejected: {0}")]
    Join(#[from] JoinRejection),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::SessionGone => "session_gone",
            Self::Forbidden(_) => "forbidden",
            Self::GuestNotFound => "guest_not_found",
            Self::UpdateExpired(_) => "update_expired",
            Self::Join(rejection) => rejection.error_code(),
            Self::BadRequest(_) => "bad_request",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound | Self::GuestNotFound | Self::UpdateExpired(_) => {
                StatusCode::NOT_FOUND
            }
            Self::SessionGone => StatusCode::GONE,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Join(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.error_code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
