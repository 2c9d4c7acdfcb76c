//! # Error Handling Module
//!
//! Unified error type for the registry cache, load balancers, external
//! registry clients, and the filter pipeline, built on `thiserror`.
//!
//! The taxonomy deliberately distinguishes cases callers must not conflate:
//! a missing tenant (`NotFound`) is not a tenant with zero groups, and a
//! service with zero instances (`NoInstances`) is not a service whose
//! instances are all unhealthy (`NoHealthyInstances`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway core.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error cases surfaced by the gateway core.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// A tenant, group, service, or instance is absent.
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// A service has zero instances. Produced before any health filtering.
    #[error("no instances available")]
    NoInstances,

    /// A service has instances, but none of them is available.
    #[error("no healthy instances available")]
    NoHealthyInstances,

    /// Missing required identifier or malformed filter configuration,
    /// detected at construction/configuration time.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Request body exceeds the configured maximum size.
    #[error("request body of {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    /// Registry backend or filter type without an implementation.
    #[error("not implemented: {what}")]
    Unsupported { what: String },

    /// Transient external registry failure, wrapped with operation context.
    #[error("external registry error: {message}")]
    ExternalRegistry { message: String },

    /// A filter failed while being applied to an in-flight request.
    #[error("filter '{name}' failed: {message}")]
    Filter { name: String, message: String },

    /// Configuration-related errors.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors when talking to an external registry.
    #[error("http client error: {message}")]
    HttpClient { message: String },

    /// JSON serialization/deserialization errors.
    #[error("json error: {message}")]
    Json { message: String },

    /// Unexpected internal failures.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalRegistry {
            message: message.into(),
        }
    }

    pub fn filter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Filter {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code the admin surface maps this error onto.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoInstances | Self::NoHealthyInstances => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::ExternalRegistry { .. } => StatusCode::BAD_GATEWAY,
            Self::Filter { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable type tag for API responses and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NoInstances => "no_instances",
            Self::NoHealthyInstances => "no_healthy_instances",
            Self::Validation { .. } => "validation_error",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::Unsupported { .. } => "unsupported",
            Self::ExternalRegistry { .. } => "external_registry_error",
            Self::Filter { .. } => "filter_error",
            Self::Configuration { .. } => "configuration_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::Json { .. } => "json_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether a request failing with this error can be safely retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstances | Self::ExternalRegistry { .. } | Self::HttpClient { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Lets the admin surface return `GatewayError` directly from axum handlers.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::not_found("service", "t1/g1/users").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoHealthyInstances.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::BodyTooLarge {
                size: 2_000_000,
                limit: 1_048_576
            }
            .status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::unsupported("etcd registry client").status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_empty_vs_missing_are_distinct() {
        let missing = GatewayError::not_found("service", "t1/g1/users");
        let empty = GatewayError::NoInstances;
        let unhealthy = GatewayError::NoHealthyInstances;
        assert_ne!(missing.error_type(), empty.error_type());
        assert_ne!(empty.error_type(), unhealthy.error_type());
    }

    #[test]
    fn test_retryable() {
        assert!(GatewayError::external("connect refused").is_retryable());
        assert!(!GatewayError::validation("missing paramName").is_retryable());
    }
}
