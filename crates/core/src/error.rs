// Central Error Type for the Application

use crate::domain::DomainError;
use crate::port::blob_store::BlobError;
use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Blob storage error: {0}")]
    Blob(#[from] BlobError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Caller-facing classification of an [`AppError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    IllegalTransition,
    Cancelled,
    Infrastructure,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) | AppError::Serialization(_) => ErrorKind::Validation,
            AppError::Domain(DomainError::Validation(_)) => ErrorKind::Validation,
            AppError::Domain(DomainError::JobIdConflict { .. }) => ErrorKind::Conflict,
            AppError::Domain(DomainError::InvalidStateTransition { .. }) => {
                ErrorKind::IllegalTransition
            }
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Blob(BlobError::NotFound { .. }) => ErrorKind::NotFound,
            AppError::Blob(BlobError::ExtensionNotAllowed { .. }) => ErrorKind::Validation,
            AppError::Conflict(_) | AppError::Concurrency(_) => ErrorKind::Conflict,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::InvalidOperation(_)
            | AppError::Blob(_)
            | AppError::Database(_)
            | AppError::Io(_)
            | AppError::Config(_)
            | AppError::Execution(_)
            | AppError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// HTTP-equivalent status for an outer surface
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthorized => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::IllegalTransition => 409,
            ErrorKind::Cancelled => 499,
            ErrorKind::Infrastructure => 500,
        }
    }

    /// Only transient infrastructure failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Io(_)
                | AppError::Execution(_)
                | AppError::Blob(BlobError::Storage(_))
        )
    }
}
