//! Error types for the clearing participant

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use transfer_saga::error::{ledger_error_type, ledger_status_code};

/// Result type for clearing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Clearing errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Message bus error
    #[error("Message bus error: {0}")]
    Bus(#[from] message_bus::Error),

    /// Handle already mapped
    #[error("Routing entry already exists for handle {0}")]
    DuplicateHandle(String),

    /// Handle not mapped
    #[error("No routing entry for handle {0}")]
    RoutingNotFound(String),

    /// Bookkeeping row not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Request or event failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for message_bus::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Bus(e) => e,
            Error::Validation(msg) => message_bus::Error::Decode(msg),
            other => message_bus::Error::Handler(other.to_string()),
        }
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
            Error::DuplicateHandle(_) => StatusCode::CONFLICT,
            Error::RoutingNotFound(_) | Error::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error {
    fn error_type(&self) -> &str {
        match self {
            Error::Ledger(e) => ledger_error_type(e),
            Error::Bus(_) => "messaging_error",
            Error::DuplicateHandle(_) => "duplicate_handle",
            Error::RoutingNotFound(_) | Error::TransactionNotFound(_) => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Config(_) => "config_error",
            Error::Io(_) => "internal_error",
        }
    }
}
