//! Error types for the bank participant

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

/// Result type for saga operations
pub type Result<T> = std::result::Result<T, Error>;

/// Saga errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Message bus error
    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Request or event failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

/// Handler failures towards the transport. Validation failures can never
/// succeed on redelivery and are reported as poison.
impl From<Error> for message_bus::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Bus(e) => e,
            Error::Validation(msg) => message_bus::Error::Decode(msg),
            other => message_bus::Error::Handler(other.to_string()),
        }
    }
}

/// HTTP status for a ledger failure
pub fn ledger_status_code(err: &ledger_core::Error) -> StatusCode {
    use ledger_core::Error as L;
    match err {
        L::AccountNotFound(_) | L::OutboxRecordNotFound(_) => StatusCode::NOT_FOUND,
        L::DuplicateAccount(_) | L::ReservationsOutstanding { .. } => StatusCode::CONFLICT,
        L::Conflict | L::ConcurrentModification { .. } => StatusCode::CONFLICT,
        L::InvalidAmount(_)
        | L::NegativeBalance(_)
        | L::BalanceOverflow { .. }
        | L::InsufficientFunds { .. }
        | L::InsufficientReserved { .. }
        | L::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        L::Storage(_) | L::Serialization(_) | L::Json(_) | L::Config(_) | L::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Machine-readable type for a ledger failure
pub fn ledger_error_type(err: &ledger_core::Error) -> &'static str {
    use ledger_core::Error as L;
    match err {
        L::AccountNotFound(_) | L::OutboxRecordNotFound(_) => "not_found",
        L::DuplicateAccount(_) => "duplicate_account",
        L::Conflict | L::ConcurrentModification { .. } => "concurrent_modification",
        L::InvalidAmount(_) | L::NegativeBalance(_) | L::BalanceOverflow { .. } => {
            "validation_error"
        }
        L::ReservationsOutstanding { .. } => "reservations_outstanding",
        L::InsufficientFunds { .. } => "insufficient_funds",
        L::InsufficientReserved { .. } => "insufficient_reserved",
        L::InvalidTransition { .. } => "invalid_transition",
        _ => "storage_error",
    }
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Ledger(e) => ledger_status_code(e),
            Error::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) | Error::Io(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error {
    fn error_type(&self) -> &str {
        match self {
            Error::Ledger(e) => ledger_error_type(e),
            Error::Bus(_) => "messaging_error",
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::Config(_) => "config_error",
            Error::Io(_) | Error::Other(_) => "internal_error",
        }
    }
}
