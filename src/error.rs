use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::{BillingError, GatewayError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Usage policy denial; the message is user-facing.
    #[error("{0}")]
    TooManyRequests(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("{0}")]
    Message(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::Billing(BillingError::AccountNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) | AppError::Billing(BillingError::InvalidAmount { .. }) => {
                StatusCode::BAD_REQUEST
            }
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) | AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Billing(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Billing(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }

        match self {
            AppError::TooManyRequests(reason) => {
                (status, Json(json!({ "error": reason }))).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
