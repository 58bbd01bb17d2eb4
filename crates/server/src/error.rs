//! HTTP error responses.
//!
//! Every failure leaves the server as a JSON envelope:
//! `{"error": "...", "code": 400, "details": "..."}`. Storage faults are
//! logged in full and answered with a generic message.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use derive_more::{Display, Error};
use serde::Serialize;
use shelf_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Display, Error)]
#[display("{status}: {message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
    }

    pub fn timed_out() -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, "Request Timeout")
    }

    pub fn unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Map a storage error, using `fallback` as the message for faults the
    /// client can do nothing about.
    pub fn from_storage(err: StorageError, fallback: &str) -> Self {
        match &*err {
            StorageErrorKind::NotFound(_) => Self::not_found("File not found"),
            StorageErrorKind::UnknownCategory(_) => Self::bad_request("Invalid category").with_details(err.to_string()),
            StorageErrorKind::SignatureMismatch(_) => {
                tracing::warn!(error = %err, "Rejected upload with invalid signature");
                Self::bad_request("Invalid file format").with_details(err.to_string())
            },
            kind if kind.is_validation() => Self::bad_request(kind.to_string()),
            _ => {
                tracing::error!(error = ?err, "Storage fault");
                Self::internal(fallback)
            },
        }
    }

    /// Map a failure reading the multipart body.
    pub fn from_multipart(err: MultipartError, invalid: &str, too_large: &str) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::too_large(too_large)
        } else {
            Self::bad_request(invalid).with_details(err.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.status.as_u16(),
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}
