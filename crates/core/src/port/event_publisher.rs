// Integration Event Port
// Cross-process messages published after a domain event commits

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum IntegrationPayload {
    ImportBatchCreated { import_batch_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub id: Uuid,
    pub occurred_on: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: IntegrationPayload,
}

impl IntegrationEvent {
    pub fn new(id: Uuid, occurred_on: DateTime<Utc>, payload: IntegrationPayload) -> Self {
        Self {
            id,
            occurred_on,
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.payload {
            IntegrationPayload::ImportBatchCreated { .. } => "import_batch_created",
        }
    }
}

#[async_trait]
pub trait IntegrationEventPublisher: Send + Sync {
    /// Completes once the bus accepted the event
    async fn publish(&self, event: IntegrationEvent) -> Result<()>;
}

/// Out-of-process consumer side
#[async_trait]
pub trait IntegrationEventHandler: Send + Sync {
    async fn handle(&self, event: &IntegrationEvent) -> Result<()>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<IntegrationEvent>>,
        fail: AtomicBool,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            let publisher = Self::default();
            publisher.fail.store(true, Ordering::SeqCst);
            publisher
        }

        pub fn events(&self) -> Vec<IntegrationEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IntegrationEventPublisher for RecordingPublisher {
        async fn publish(&self, event: IntegrationEvent) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Execution("message bus unavailable".to_string()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}
