use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Delivery errors that do not map onto a transport condition
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Service is up but has not finished replaying
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Integration errors
    #[error("Integration error ({integration_source}): {message}")]
    Integration { integration_source: String, message: String },
}

impl AppError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Integration { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::NotReady(_) => "NOT_READY",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Network(_) => "NETWORK_ERROR",
            AppError::Delivery(_) => "DELIVERY_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Integration { .. } => "INTEGRATION_ERROR",
        }
    }
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(
                error_code = error_code,
                status_code = status.as_u16(),
                message = %message,
                "Request error"
            );
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(err.to_string())
        } else {
            AppError::Network(err.to_string())
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::NotFound("test".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NotReady("replaying".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Delivery("closed".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::Configuration("test".to_string()).error_code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            AppError::Integration {
                integration_source: "consul".to_string(),
                message: "down".to_string()
            }
            .error_code(),
            "INTEGRATION_ERROR"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let err: AppError = config::ConfigError::Message("missing key".to_string()).into();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
