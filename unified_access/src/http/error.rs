//! Error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{Error, ErrorDetail, ErrorKind};

/// An error rendered as `{"error": kind, "detail": message}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl ApiError {
    pub fn unknown_resource(resource: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: ErrorDetail::new(
                ErrorKind::NotFound,
                format!("no resource named '{}'", resource),
            ),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = StatusCode::from_u16(error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %error, "Request failed");
        }
        Self {
            status,
            detail: error.detail(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.detail)).into_response()
    }
}
