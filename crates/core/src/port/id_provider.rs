// ID Provider Port (for deterministic testing)

use uuid::Uuid;

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new time-ordered identifier
    fn generate_id(&self) -> Uuid;
}

/// UUID v7 provider (production)
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Yields 00000000-0000-0000-0000-000000000001, ...02, ...
    pub struct SequentialIdProvider {
        next: AtomicU64,
    }

    impl SequentialIdProvider {
        pub fn new() -> Self {
            Self {
                next: AtomicU64::new(1),
            }
        }
    }

    impl Default for SequentialIdProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl IdProvider for SequentialIdProvider {
        fn generate_id(&self) -> Uuid {
            Uuid::from_u128(self.next.fetch_add(1, Ordering::SeqCst) as u128)
        }
    }
}
