// Batch Processor Port
// Reads an uploaded history file and reports reconciliation findings

use crate::domain::{ImportBatch, OutcomeFlags};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Errors are recorded on the batch
    ///
    /// Retryable errors (see `AppError::is_retryable`) are tried again by the
    /// caller; any other error fails the batch at once.
    async fn process(&self, batch: &ImportBatch, content: Vec<u8>) -> Result<OutcomeFlags>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Outcome {
        Flags(OutcomeFlags),
        Retryable(String),
        Rejected(String),
    }

    pub struct StaticProcessor {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl StaticProcessor {
        fn with(outcome: Outcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn succeeding(flags: OutcomeFlags) -> Self {
            Self::with(Outcome::Flags(flags))
        }

        /// Fails with a retryable `Execution` error
        pub fn failing(message: impl Into<String>) -> Self {
            Self::with(Outcome::Retryable(message.into()))
        }

        /// Fails with a `Validation` error, as for a malformed file
        pub fn rejecting(message: impl Into<String>) -> Self {
            Self::with(Outcome::Rejected(message.into()))
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchProcessor for StaticProcessor {
        async fn process(&self, _batch: &ImportBatch, _content: Vec<u8>) -> Result<OutcomeFlags> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Outcome::Flags(flags) => Ok(*flags),
                Outcome::Retryable(m) => Err(AppError::Execution(m.clone())),
                Outcome::Rejected(m) => Err(AppError::Validation(m.clone())),
            }
        }
    }
}
