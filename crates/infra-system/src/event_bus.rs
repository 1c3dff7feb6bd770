// In-process integration event bus (tokio broadcast)

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transit_core::error::Result;
use transit_core::port::{IntegrationEvent, IntegrationEventHandler, IntegrationEventPublisher};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Fan-out bus; every subscriber sees every event published after it subscribed
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<IntegrationEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.sender.subscribe()
    }

    /// Feed events to `handler` until `shutdown` fires or the bus closes
    ///
    /// Events already buffered when `shutdown` fires are still handled.
    /// Handler failures are logged and the loop keeps going.
    pub async fn consume(
        mut receiver: broadcast::Receiver<IntegrationEvent>,
        handler: Arc<dyn IntegrationEventHandler>,
        shutdown: CancellationToken,
    ) {
        info!("Integration event consumer started");
        loop {
            let received = tokio::select! {
                biased;
                received = receiver.recv() => received,
                _ = shutdown.cancelled() => break,
            };

            match received {
                Ok(event) => {
                    if let Err(e) = handler.handle(&event).await {
                        error!(
                            event_id = %event.id,
                            event_type = event.event_type(),
                            error = %e,
                            "Integration event handler failed"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Integration event consumer lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Integration event consumer stopped");
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[async_trait]
impl IntegrationEventPublisher for BroadcastEventBus {
    async fn publish(&self, event: IntegrationEvent) -> Result<()> {
        let event_id = event.id;
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(event_id = %event_id, event_type = event_type, receivers = receivers, "Integration event published");
            }
            Err(_) => {
                warn!(event_id = %event_id, event_type = event_type, "Integration event published with no subscribers");
            }
        }
        Ok(())
    }
}
