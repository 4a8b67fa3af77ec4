//! Public error taxonomy and its HTTP mapping.
//!
//! Every failure surfaced to a caller is one of these kinds; internal causes
//! (SQL text, connection errors) are logged but never leaked in the response
//! body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::coordinator::CoordinatorError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("no sale is currently active")]
    SaleInactive,
    #[error("item does not belong to the active sale")]
    UnknownItem,
    #[error("invalid or expired checkout code")]
    InvalidOrExpiredCode,
    #[error("user purchase limit reached for this sale")]
    UserLimitExceeded,
    #[error("item sold out")]
    SoldOut,
    #[error("purchase conflicts with an existing record")]
    Conflict,
    #[error("service temporarily unavailable, please retry")]
    Transient,
    #[error("internal error")]
    Internal,
}

/// Error envelope shared by all endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::UnknownItem | ApiError::InvalidOrExpiredCode => {
                StatusCode::BAD_REQUEST
            }
            ApiError::UserLimitExceeded => StatusCode::FORBIDDEN,
            ApiError::SaleInactive | ApiError::SoldOut | ApiError::Conflict => {
                StatusCode::CONFLICT
            }
            ApiError::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            success: false,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(constraint) => {
                tracing::warn!(constraint = %constraint, "store conflict");
                ApiError::Conflict
            }
            StoreError::Connection(e) | StoreError::Database(e) => {
                tracing::error!(error = %e, "store unavailable");
                ApiError::Transient
            }
            StoreError::NotFound => {
                tracing::error!("unexpected missing store record");
                ApiError::Internal
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Connection(e) => {
                tracing::error!(error = %e, "coordinator unavailable");
                ApiError::Transient
            }
            CoordinatorError::Backend(e) | CoordinatorError::Serialization(e) => {
                tracing::error!(error = %e, "coordinator failure");
                ApiError::Internal
            }
        }
    }
}
