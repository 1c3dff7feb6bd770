// Domain Events - in-process notifications buffered on entities

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    ImportBatchCreated {
        batch_id: Uuid,
        card_id: Uuid,
        sha256: String,
        occurred_at: DateTime<Utc>,
    },
}

/// Registration key for event handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    ImportBatchCreated,
}

impl DomainEvent {
    pub fn kind(&self) -> DomainEventKind {
        match self {
            DomainEvent::ImportBatchCreated { .. } => DomainEventKind::ImportBatchCreated,
        }
    }
}

/// Entity that records domain events until the next save drains them
pub trait EventSource {
    fn pending_events(&self) -> &[DomainEvent];

    /// Read-then-clear; a second call returns nothing until new events are recorded
    fn take_domain_events(&mut self) -> Vec<DomainEvent>;

    /// Put drained events back when the surrounding commit failed
    fn restore_domain_events(&mut self, events: Vec<DomainEvent>);
}
