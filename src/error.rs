use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Renewal error: {0}")]
    Renewal(#[from] RenewalError),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Amount sign does not match transaction type {tx_type}: {amount}")]
    InvalidAmountSign { tx_type: String, amount: String },

    #[error("Ledger row not found for payment: {0}")]
    RowNotFound(String),
}

/// Payment lifecycle errors
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Payment in invalid state: {current}, expected: {expected}")]
    InvalidState { current: String, expected: String },
}

/// Renewal sweep errors
#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Payment(PaymentError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "PAYMENT_NOT_FOUND",
                format!("Payment not found: {}", id),
            ),
            AppError::Payment(PaymentError::InvalidState { current, expected }) => (
                StatusCode::CONFLICT,
                "PAYMENT_INVALID_STATE",
                format!("Payment in state {}, expected {}", current, expected),
            ),
            AppError::Ledger(LedgerError::InsufficientBalance { required, available }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_BALANCE",
                format!(
                    "Insufficient balance: required {}, available {}",
                    required, available
                ),
            ),
            AppError::InvalidInput(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone())
            }
            AppError::Provider(msg) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                format!("Provider error: {}", msg),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details: None,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Provider(format!("HTTP request error: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
