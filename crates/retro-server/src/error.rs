use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use retro_types::RetroError;
use serde_json::json;

/// An HTTP failure: status code, optional status tag, diagnostic text.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub tag: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            tag: None,
            message: message.into(),
        }
    }

    /// A failed stage or pipeline, reported under its tag.
    pub fn tagged(code: u16, tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Self::new(code, message)
        }
    }
}

impl From<RetroError> for ApiError {
    fn from(err: RetroError) -> Self {
        Self::new(err.http_status(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, tag = ?self.tag, message = %self.message, "request failed");
        } else {
            tracing::warn!(status = %self.status, tag = ?self.tag, message = %self.message, "request rejected");
        }
        let body = crate::stamp(
            "error",
            json!({ "tag": self.tag, "message": self.message }),
        );
        (self.status, Json(body)).into_response()
    }
}
