// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Illegal transition {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Already queued with job id {existing}")]
    JobIdConflict { existing: String, requested: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
