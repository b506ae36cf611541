use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtpError {
    #[error("no delivery code has been issued for this order")]
    NotIssued,

    #[error("code expired, request a new one")]
    Expired,

    #[error("code was already used")]
    AlreadyUsed,

    #[error("too many incorrect attempts, request a new code")]
    TooManyAttempts,

    #[error("code does not match, {remaining} attempt(s) left")]
    Mismatch { remaining: u32 },
}

impl OtpError {
    pub fn code(&self) -> &'static str {
        match self {
            OtpError::NotIssued => "otp_not_issued",
            OtpError::Expired => "otp_expired",
            OtpError::AlreadyUsed => "otp_already_used",
            OtpError::TooManyAttempts => "otp_too_many_attempts",
            OtpError::Mismatch { .. } => "otp_mismatch",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("already assigned to another courier")]
    OfferAlreadyTaken,

    #[error("courier already has an active order")]
    CourierBusy,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Otp(#[from] OtpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Forbidden(_) => "forbidden",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::OfferAlreadyTaken => "offer_already_taken",
            AppError::CourierBusy => "courier_busy",
            AppError::Conflict(_) => "conflict",
            AppError::Otp(err) => err.code(),
            AppError::Store(_) => "store_unavailable",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::InvalidTransition { .. }
            | AppError::OfferAlreadyTaken
            | AppError::CourierBusy => (StatusCode::CONFLICT, self.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Otp(OtpError::TooManyAttempts) => {
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            AppError::Otp(OtpError::Expired) => (StatusCode::GONE, self.to_string()),
            AppError::Otp(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            AppError::Store(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
