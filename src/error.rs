use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid request: {0}")]
    Http(#[from] axum::http::Error),

    #[error("Failed to read request body: {0}")]
    ClientBody(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Status { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Decode(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Http(_) => StatusCode::BAD_REQUEST,
            ProxyError::ClientBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
            ProxyError::Status { .. } => "UPSTREAM_STATUS",
            ProxyError::Decode(_) => "DECODE_ERROR",
            ProxyError::Cancelled(_) => "CANCELLED",
            ProxyError::Http(_) => "BAD_REQUEST",
            ProxyError::ClientBody(_) => "BAD_REQUEST",
            ProxyError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ProxyError::Config(message.into())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
