use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::models::AccountType;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Treasury error: {0}")]
    Treasury(#[from] TreasuryError),

    #[error("Bot error: {0}")]
    Bot(#[from] BotError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Ledger / transaction-service errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Idempotency hit - the caller gets the original result, not a failure
    #[error("Transaction with idempotency key already exists: {0}")]
    DuplicateKey(String),

    #[error("Insufficient funds in {account_type} account: required {required}, available {available}")]
    InsufficientFunds {
        account_type: AccountType,
        required: i64,
        available: i64,
    },

    #[error("Version conflict on account {account_id}: expected {expected}")]
    VersionConflict { account_id: uuid::Uuid, expected: i64 },

    #[error("Optimistic lock retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Account not found: {0}")]
    AccountNotFound(uuid::Uuid),

    #[error("Transaction amount must be non-zero")]
    ZeroAmount,

    #[error("Idempotency key must not be empty")]
    MissingIdempotencyKey,

    #[error("Journal entries do not sum to zero: {0}")]
    UnbalancedEntries(i64),
}

/// Treasury errors
#[derive(Error, Debug)]
pub enum TreasuryError {
    #[error("Treasury exhausted: required {required}, available {available}")]
    Exhausted { required: i64, available: i64 },

    #[error("Treasury daily limit exceeded: {spent} + {attempted} > {limit}")]
    DailyLimitExceeded {
        spent: i64,
        attempted: i64,
        limit: i64,
    },

    #[error("Bot spending is disabled")]
    Disabled,
}

/// Bot orchestration errors
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Bot not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Daily cap reached for {kind}: {cap}")]
    CapExhausted { kind: String, cap: i32 },

    #[error("Bot action not found: {0}")]
    ActionNotFound(uuid::Uuid),

    #[error("Refund not found: {0}")]
    RefundNotFound(uuid::Uuid),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
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
        let (status, error_code, message, details) = match &self {
            AppError::Ledger(LedgerError::InsufficientFunds {
                account_type,
                required,
                available,
            }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INSUFFICIENT_FUNDS",
                self.to_string(),
                Some(serde_json::json!({
                    "account_type": account_type,
                    "required": required,
                    "available": available,
                })),
            ),
            AppError::Ledger(LedgerError::RetriesExhausted { .. }) => (
                StatusCode::CONFLICT,
                "VERSION_CONFLICT",
                self.to_string(),
                None,
            ),
            AppError::Treasury(TreasuryError::Exhausted { required, available }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "TREASURY_EXHAUSTED",
                self.to_string(),
                Some(serde_json::json!({
                    "required": required,
                    "available": available,
                })),
            ),
            AppError::Treasury(TreasuryError::DailyLimitExceeded { spent, attempted, limit }) => (
                StatusCode::TOO_MANY_REQUESTS,
                "DAILY_LIMIT_EXCEEDED",
                self.to_string(),
                Some(serde_json::json!({
                    "spent": spent,
                    "attempted": attempted,
                    "limit": limit,
                })),
            ),
            AppError::Treasury(TreasuryError::Disabled) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "BOTS_DISABLED",
                self.to_string(),
                None,
            ),
            AppError::Bot(BotError::CapExhausted { kind, cap }) => (
                StatusCode::TOO_MANY_REQUESTS,
                "CAP_EXHAUSTED",
                self.to_string(),
                Some(serde_json::json!({ "kind": kind, "cap": cap })),
            ),
            AppError::Bot(
                BotError::NotFound(_) | BotError::ActionNotFound(_) | BotError::RefundNotFound(_),
            )
            | AppError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                self.to_string(),
                None,
            ),
            AppError::InvalidInput(msg) | AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
