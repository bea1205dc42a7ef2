use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use downloader::manager;
use thiserror::Error;

use crate::api::ErrorBody;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<manager::Error> for ApiError {
    fn from(e: manager::Error) -> Self {
        let msg = e.to_string();
        match e {
            manager::Error::NotFound(_) => ApiError::NotFound(msg),
            manager::Error::EmptySubmission
            | manager::Error::InvalidUrl { .. }
            | manager::Error::NotReady { .. } => ApiError::BadRequest(msg),
            manager::Error::FileMissing(_) | manager::Error::QueueClosed => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
