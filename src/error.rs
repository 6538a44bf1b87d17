use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

use crate::ledger::models::PermitStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid permit: {0}")]
    Permit(#[from] PermitError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Reimbursement error: {0}")]
    Reimbursement(#[from] ReimbursementError),

    #[error("Chain client error: {0}")]
    Chain(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: PermitStatus, to: PermitStatus },

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Intake rejections. Nothing is stored when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermitError {
    #[error("Nonce {nonce} already used or not above {last} for this user and service")]
    NonceReused { nonce: u64, last: u64 },

    #[error("Permit expiry is in the past")]
    Expired,

    #[error("Max fee must be positive")]
    ZeroMaxFee,

    #[error("Max fee {max_fee} is below the estimated fee {estimated}")]
    MaxFeeTooLow { max_fee: u64, estimated: u64 },

    #[error("Instruction payload is empty")]
    EmptyPayload,

    #[error("Malformed instruction payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service {0} is not active")]
    InactiveService(String),

    #[error("Program {program} is not allowed for service {service_id}")]
    ProgramNotAllowed { program: String, service_id: String },

    #[error("Permit signature already submitted")]
    SignatureReplayed,

    #[error("Permit signature verification failed")]
    BadSignature,
}

/// Failures of a single gasless execution attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Invalid instruction data")]
    InvalidInstructionData,

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Transaction failed on-chain: {0}")]
    OnChain(String),

    #[error("Confirmation timed out for {0}")]
    Timeout(String),

    #[error("Blockhash expired before {0} landed")]
    BlockhashExpired(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Estimated fee {estimated} exceeds the permit's max fee {max_fee}")]
    FeeCapExceeded { estimated: u64, max_fee: u64 },
}

impl ExecutionError {
    /// Whether another attempt with a fresh blockhash can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutionError::InvalidInstructionData | ExecutionError::FeeCapExceeded { .. }
        )
    }
}

/// Failures of the treasury-signed reimbursement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReimbursementError {
    #[error("Service {0} is not active")]
    InactiveService(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid fee configuration: {0}")]
    InvalidFeeConfig(String),

    #[error("Reimbursement transaction failed: {0}")]
    Transaction(String),
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
        let (status, error_code, message, details) = match self {
            AppError::Permit(err) => (
                StatusCode::BAD_REQUEST,
                "INVALID_PERMIT",
                err.to_string(),
                None,
            ),
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::InvalidAddress(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ADDRESS",
                msg,
                None,
            ),
            AppError::InvalidSignature(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_SIGNATURE",
                msg,
                None,
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Too many claims, please wait before retrying".to_string(),
                Some(serde_json::json!({ "retry_after_secs": retry_after_secs })),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            AppError::Chain(_) => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_UNAVAILABLE",
                "The chain RPC is unavailable".to_string(),
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

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
