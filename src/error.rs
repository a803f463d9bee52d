use thiserror::Error;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to create HTTP client: {0}")]
    HttpClientCreationError(reqwest::Error),

    #[error("HTTP request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Lookup file error at {path}: {source}")]
    LookupIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lookup file format error at {path}: {source}")]
    LookupFormat {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Invalid alert payload: {0}")]
    PayloadError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Slack API error: {0}")]
    SlackApiError(String),

    #[error("Invalid Slack signature")]
    InvalidSignature,

    #[error("FortiGate API error: {0}")]
    FortiGateApiError(String),

    #[error("Alert with ID '{0}' not found")]
    AlertNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            BridgeError::HttpClientCreationError(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error: {}", e),
            ),
            BridgeError::RequestError(e) => {
                if e.is_connect() || e.is_timeout() {
                    (
                        StatusCode::BAD_GATEWAY,
                        format!("Could not reach upstream API: {}", e),
                    )
                } else {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Upstream API request error: {}", e),
                    )
                }
            }
            BridgeError::LookupIo { path, source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Lookup file error at {}: {}", path, source),
            ),
            BridgeError::LookupFormat { path, source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Lookup file format error at {}: {}", path, source),
            ),
            BridgeError::PayloadError(msg) => {
                (StatusCode::BAD_REQUEST, format!("Invalid payload: {}", msg))
            }
            BridgeError::JsonError(e) => (
                StatusCode::BAD_REQUEST,
                format!("Failed to parse request body: {}", e),
            ),
            BridgeError::SlackApiError(msg) => {
                (StatusCode::BAD_GATEWAY, format!("Slack API error: {}", msg))
            }
            BridgeError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "Invalid Slack signature".to_string(),
            ),
            BridgeError::FortiGateApiError(msg) => (
                StatusCode::BAD_GATEWAY,
                format!("FortiGate API error: {}", msg),
            ),
            BridgeError::AlertNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Alert with ID '{}' not found", id),
            ),
            BridgeError::ConfigError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Configuration error: {}", msg),
            ),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
