//! HTTP error responses

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use batchloop_common::BatchLoopError;
use batchloop_proto::{ErrorDetail, ErrorResponse};

/// Seconds a client should wait before retrying a transient failure
pub const RETRY_AFTER_SECS: u64 = 1;

/// A [`BatchLoopError`] on its way to the client
#[derive(Debug)]
pub struct ApiError(pub BatchLoopError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            BatchLoopError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            BatchLoopError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BatchLoopError::ShutdownInFlight(_) | BatchLoopError::QueueFull(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BatchLoopError::PredictionFailure(_)
            | BatchLoopError::Config(_)
            | BatchLoopError::Serialization(_)
            | BatchLoopError::Io(_)
            | BatchLoopError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorResponse {
        let r#type = if self.0.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };

        ErrorResponse {
            error: ErrorDetail {
                message: self.0.to_string(),
                r#type: r#type.to_string(),
            },
        }
    }
}

impl From<BatchLoopError> for ApiError {
    fn from(err: BatchLoopError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status_code(), Json(self.body())).into_response();
        if self.0.is_transient() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, RETRY_AFTER_SECS.into());
        }
        response
    }
}
