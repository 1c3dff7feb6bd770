// Domain Event Dispatch
// In-process handlers invoked by the unit of work after a successful commit

use crate::domain::{DomainEvent, DomainEventKind};
use crate::error::Result;
use crate::port::{IdProvider, IntegrationEvent, IntegrationEventPublisher, IntegrationPayload, TimeProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Event kind -> handlers, built once at startup
#[derive(Default)]
pub struct DomainEventDispatcher {
    handlers: HashMap<DomainEventKind, Vec<Arc<dyn DomainEventHandler>>>,
}

impl DomainEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: DomainEventKind, handler: Arc<dyn DomainEventHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: DomainEventKind) -> usize {
        self.handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Run every handler for every event in order; the first error stops dispatch
    pub async fn dispatch(&self, events: &[DomainEvent]) -> Result<()> {
        for event in events {
            let Some(handlers) = self.handlers.get(&event.kind()) else {
                debug!(kind = ?event.kind(), "No handler registered for domain event");
                continue;
            };
            for handler in handlers {
                handler.handle(event).await?;
            }
        }
        Ok(())
    }
}

/// Republishes a created batch as an integration event carrying only its id
pub struct ImportBatchCreatedHandler {
    publisher: Arc<dyn IntegrationEventPublisher>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ImportBatchCreatedHandler {
    pub fn new(
        publisher: Arc<dyn IntegrationEventPublisher>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            publisher,
            id_provider,
            time_provider,
        }
    }
}

#[async_trait]
impl DomainEventHandler for ImportBatchCreatedHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let DomainEvent::ImportBatchCreated { batch_id, .. } = event;

        let integration = IntegrationEvent::new(
            self.id_provider.generate_id(),
            self.time_provider.now(),
            IntegrationPayload::ImportBatchCreated {
                import_batch_id: *batch_id,
            },
        );
        self.publisher.publish(integration).await?;

        info!(batch_id = %batch_id, "Published import batch created event");
        Ok(())
    }
}

/// Dispatcher with the handlers every deployment needs
pub fn default_dispatcher(
    publisher: Arc<dyn IntegrationEventPublisher>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
) -> DomainEventDispatcher {
    let mut dispatcher = DomainEventDispatcher::new();
    dispatcher.register(
        DomainEventKind::ImportBatchCreated,
        Arc::new(ImportBatchCreatedHandler::new(
            publisher,
            id_provider,
            time_provider,
        )),
    );
    dispatcher
}
