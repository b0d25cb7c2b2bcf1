//! Outward-facing event stream.
//!
//! Components report lifecycle occurrences here for external monitoring.
//! Internal wiring never goes through this channel; components call each
//! other directly.

use tokio::sync::broadcast;

use liaison_wire::BrokerEvent;

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event. Having no subscribers is not an error.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }
}
