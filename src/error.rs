use thiserror::Error;

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No keys available: {0}")]
    NoKeysAvailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Terminal upstream failure whose body was not valid JSON; the raw
    /// message is wrapped instead of forwarded verbatim.
    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

impl ProxyError {
    fn user_message(&self) -> String {
        match self {
            ProxyError::BadRequest(s)
            | ProxyError::NoKeysAvailable(s)
            | ProxyError::NotFound(s)
            | ProxyError::Config(s)
            | ProxyError::Internal(s) => s.clone(),
            ProxyError::Upstream { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoKeysAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ProxyError::Http(_) => "http_error",
            ProxyError::Json(_) => "json_error",
            ProxyError::Toml(_) => "toml_error",
            ProxyError::Db(_) => "db_error",
            ProxyError::Io(_) => "io_error",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::NoKeysAvailable(_) => "no_keys_available",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::Config(_) => "config_error",
            ProxyError::Internal(_) => "internal_error",
            ProxyError::Upstream { .. } => "UPSTREAM_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code(),
            message: self.user_message(),
            status: match &self {
                ProxyError::Upstream { status, .. } => Some(*status),
                _ => None,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_keys_maps_to_503() {
        let err = ProxyError::NoKeysAvailable("pool dry".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_error_keeps_upstream_status() {
        let err = ProxyError::Upstream {
            status: 429,
            message: "rate limit".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
