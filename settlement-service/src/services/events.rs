//! Real-time payment events.

use crate::models::PaymentEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

pub trait EventBroadcaster: Send + Sync {
    fn publish(&self, event: PaymentEvent);
}

/// In-process fan-out over a tokio broadcast channel. Slow subscribers lag
/// and lose events rather than blocking publishers.
#[derive(Clone)]
pub struct BroadcastEvents {
    sender: broadcast::Sender<PaymentEvent>,
}

impl BroadcastEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PaymentEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster for BroadcastEvents {
    fn publish(&self, event: PaymentEvent) {
        let name = event.name();
        // No subscribers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        tracing::debug!(event = name, receivers, "Payment event published");
    }
}
