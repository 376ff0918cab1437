use crate::{CoreError, EventPublisher, EventSubscriber, domain::events::BillingEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Sender};

/// Topic-keyed broadcast channels for change notifications.
///
/// Receivers that fall behind by more than the channel capacity miss events
/// (`RecvError::Lagged`); subscribers are expected to resync from storage.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    channels: Arc<DashMap<String, Sender<BillingEvent>>>,
    channel_capacity: usize,
}

impl InMemoryEventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            channel_capacity,
        }
    }

    fn get_or_create_sender(&self, topic: &str) -> Sender<BillingEvent> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.channel_capacity);
                sender
            })
            .value()
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, topic: &str, event: &BillingEvent) -> Result<(), CoreError> {
        // An error only means nobody is listening right now.
        if self.get_or_create_sender(topic).send(event.clone()).is_err() {
            tracing::trace!(topic, event_type = event.event_type(), "no subscribers");
        }
        Ok(())
    }
}

impl EventSubscriber for InMemoryEventBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BillingEvent> {
        self.get_or_create_sender(topic).subscribe()
    }
}
