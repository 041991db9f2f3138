//! Error types and HTTP response conversion.
//!
//! The [`Error`] enum covers the client-visible error cases of the proxy and
//! admin surfaces. Every variant converts into the JSON envelope
//!
//! ```json
//! {"error": {"message": "...", "type": "...", "code": "..."}}
//! ```
//!
//! except [`Error::Upstream`], which relays the upstream's own status and
//! body untouched so clients see exactly what the provider said.

use crate::store::StoreError;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Identity headers absent: the request did not come through the edge.
    #[error("missing consumer identity")]
    Unauthenticated,

    /// Model identifier is not `provider/modelName` with a known provider.
    #[error("invalid model format: {model:?}")]
    InvalidModelFormat { model: String },

    /// No pricing row for the model; rejected before any upstream spend.
    #[error("unsupported model: {provider}/{model}")]
    UnsupportedModel { provider: String, model: String },

    /// Consumer has spent their quota.
    #[error("quota exceeded for consumer {consumer_id}")]
    QuotaExceeded { consumer_id: String },

    /// Estimated prompt exceeds the local model's context window.
    #[error("estimated {estimated} prompt tokens exceed the {limit}-token context of {model}")]
    ContextLengthExceeded {
        model: String,
        estimated: i64,
        limit: u64,
    },

    /// Malformed request payload.
    #[error("{message}")]
    BadRequest { message: String },

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// An upstream response to relay verbatim (status, body, content type).
    #[error("upstream returned {status}")]
    Upstream {
        status: StatusCode,
        body: Bytes,
        content_type: Option<HeaderValue>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::InvalidModelFormat { .. }
            | Error::UnsupportedModel { .. }
            | Error::ContextLengthExceeded { .. }
            | Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Upstream { status, .. } => *status,
            Error::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            Error::Store(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "unauthenticated",
            Error::InvalidModelFormat { .. } => "invalid_model_format",
            Error::UnsupportedModel { .. } => "unsupported_model",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::ContextLengthExceeded { .. } => "context_length_exceeded",
            Error::BadRequest { .. } => "bad_request",
            Error::NotFound { .. } => "not_found",
            Error::Upstream { .. } => "upstream_error",
            Error::Store(_) | Error::Other(_) => "internal_error",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "authentication_error",
            Error::QuotaExceeded { .. } => "rate_limit_error",
            Error::Store(_) | Error::Other(_) | Error::Upstream { .. } => "api_error",
            _ => "invalid_request_error",
        }
    }

    /// User-safe message; internal failures are not leaked.
    fn user_message(&self) -> String {
        match self {
            Error::Store(_) | Error::Other(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Store(_) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Upstream { status, .. } => {
                tracing::debug!(status = status.as_u16(), "Relaying upstream error");
            }
            Error::QuotaExceeded { .. } => {
                tracing::info!("Quota exceeded: {}", self);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }

        if let Error::Upstream {
            status,
            body,
            content_type,
        } = self
        {
            let mut response = Response::builder().status(status);
            if let Some(content_type) = content_type {
                response = response.header(header::CONTENT_TYPE, content_type);
            }
            return response
                .body(axum::body::Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
        }

        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.user_message(),
                "type": self.error_type(),
                "code": self.code(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Type alias for handler results.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn envelope(error: Error) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn maps_variants_to_statuses_and_codes() {
        let (status, body) = envelope(Error::UnsupportedModel {
            provider: "openai".to_string(),
            model: "gpt-99".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "unsupported_model");
        assert_eq!(body["error"]["type"], "invalid_request_error");

        let (status, body) = envelope(Error::QuotaExceeded {
            consumer_id: "alice".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "quota_exceeded");

        let (status, _) = envelope(Error::Unauthenticated).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() {
        let (status, body) = envelope(Error::Other(anyhow::anyhow!("secret connection string"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "internal server error");
    }

    #[tokio::test]
    async fn upstream_errors_relay_raw_body() {
        let error = Error::Upstream {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: Bytes::from_static(b"{\"error\":{\"message\":\"overloaded\"}}"),
            content_type: Some(HeaderValue::from_static("application/json")),
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"error\":{\"message\":\"overloaded\"}}");
    }
}
