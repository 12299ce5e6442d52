use crate::services::{
    metadata_store::StoreError, multipart::MultipartError, resumable::UploadError,
};
use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

pub const UPLOAD_STATUS_HEADER: &str = "x-goog-upload-status";

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra response headers, e.g. the upload status on a double finalize.
    pub headers: HeaderMap,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
            }
        }));

        (self.status, self.headers, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::ObjectNotFound { .. } => AppError::not_found(message),
            StoreError::Forbidden(_) => AppError::forbidden(message),
            StoreError::InvalidBucketName { .. }
            | StoreError::InvalidObjectPath
            | StoreError::BadRequest(_) => AppError::bad_request(message),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let message = err.to_string();
        match err {
            UploadError::SessionNotFound(_) | UploadError::SessionCancelled(_) => {
                AppError::not_found(message)
            }
            UploadError::AlreadyFinalized(_) => {
                AppError::bad_request(message).with_header(UPLOAD_STATUS_HEADER, "final")
            }
            UploadError::Forbidden(_) => AppError::forbidden(message),
            UploadError::Store(inner) => inner.into(),
            UploadError::OffsetMismatch { .. }
            | UploadError::MissingOffset
            | UploadError::InvalidOffset(_)
            | UploadError::TooLarge { .. }
            | UploadError::MissingObjectName
            | UploadError::MissingCommand
            | UploadError::UnknownCommand(_)
            | UploadError::UnexpectedCommand(_)
            | UploadError::UnknownProtocol(_)
            | UploadError::InvalidMetadata(_) => AppError::bad_request(message),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::{AccessDenied, Actor, Capability};

    #[test]
    fn double_finalize_reports_final_status() {
        let err = AppError::from(UploadError::AlreadyFinalized("id".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.headers.get(UPLOAD_STATUS_HEADER).unwrap(), "final");
    }

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let denied = AccessDenied {
            actor: Actor::Anonymous,
            capability: Capability::Write,
            bucket: "b".into(),
            path: "p".into(),
        };
        assert_eq!(
            AppError::from(UploadError::Forbidden(denied)).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(UploadError::SessionNotFound("x".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(UploadError::OffsetMismatch {
                expected: 1,
                got: 2
            })
            .status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(UploadError::Store(StoreError::ObjectNotFound {
                bucket: "b".into(),
                path: "p".into()
            }))
            .status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(MultipartError::BadContentType("x".into())).status,
            StatusCode::BAD_REQUEST
        );
    }
}
