use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Service not found: {0}")]
    NotFound(String),
    /// The store could not be reached; the service is temporarily undiscoverable
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
    #[error("Service {0} has no nodes")]
    EmptyRecord(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for RegistryError {
    fn from(err: redis::RedisError) -> Self {
        RegistryError::Unavailable(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No route for {0}")]
    RouteNotFound(String),
    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),
    #[error("Missing bearer token")]
    Unauthorized,
    #[error("No healthy node for service {0}")]
    NoHealthyNode(String),
    #[error("Circuit open for {0}")]
    CircuitOpen(String),
    #[error("Upstream {address} failed: {reason}")]
    Upstream { address: String, reason: String },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NoHealthyNode(_) | GatewayError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound(_) => "route_not_found",
            GatewayError::MethodNotAllowed(_) => "method_not_allowed",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::NoHealthyNode(_) => "no_healthy_node",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::Upstream { .. } => "bad_gateway",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::NotFound("dict-svc".to_string());
        assert_eq!(err.to_string(), "Service not found: dict-svc");
    }

    #[test]
    fn test_redis_error_maps_to_unavailable() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err: RegistryError = redis_err.into();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[test]
    fn test_gateway_error_status_codes() {
        assert_eq!(GatewayError::RouteNotFound("/x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::MethodNotAllowed("PUT".into()).status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(GatewayError::NoHealthyNode("a".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(GatewayError::CircuitOpen("a".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        let upstream = GatewayError::Upstream {
            address: "10.0.0.1:9000".into(),
            reason: "refused".into(),
        };
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
        assert!(upstream.to_string().contains("10.0.0.1:9000"));
        assert_eq!(GatewayError::BadRequest("eof".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::PayloadTooLarge(4).status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_payload_too_large_body() {
        let response = GatewayError::PayloadTooLarge(1024).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "payload_too_large");
        assert_eq!(json["message"], "Request body exceeds 1024 bytes");
    }
}
