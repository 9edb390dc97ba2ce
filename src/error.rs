//! 统一的 API 错误类型与转换。

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use std::io::ErrorKind;
use tracing::{debug, error};

use crate::response::ApiResponse;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    MethodNotAllowed,
    PayloadTooLarge,
    Internal(String),
    RangeNotSatisfiable(u64),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
            ApiError::MethodNotAllowed => "Method not allowed".into(),
            ApiError::PayloadTooLarge => "Request body too large".into(),
            ApiError::RangeNotSatisfiable(_) => "Range not satisfiable".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut headers = HeaderMap::new();
        if let ApiError::RangeNotSatisfiable(size) = &self
            && let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}"))
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
        let body = ApiResponse::failure(self.message());
        (status, headers, JsonResponse(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidName => ApiError::BadRequest("Invalid file name".into()),
            StorageError::NotAFile => ApiError::BadRequest("Path is not a file".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
                _ => {
                    error!(error = %err, "storage i/o failure");
                    ApiError::Internal("Internal server error".into())
                }
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!(error = %rejection, "json body rejected");
        ApiError::BadRequest("Invalid request".into())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        debug!(error = %rejection, "multipart body rejected");
        ApiError::BadRequest("Failed to parse form".into())
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        debug!(error = %error, "multipart stream failed");
        ApiError::BadRequest("Failed to parse form".into())
    }
}
