//! Per-identity store-and-forward queues.
//!
//! Messages addressed to an identity that is not currently connected are held
//! here in arrival order until the router drains them on reconnect. Queues
//! are in-memory only and vanish with the broker process.

use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;
use tracing::debug;

use liaison_wire::WireMessage;

#[derive(Default)]
pub struct MessageQueues {
    queues: RwLock<HashMap<String, VecDeque<WireMessage>>>,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to an identity's queue. Returns the queue depth
    /// after the append.
    pub async fn enqueue(&self, identity: &str, message: WireMessage) -> usize {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(identity.to_string()).or_default();
        queue.push_back(message);
        let depth = queue.len();
        debug!(identity = %identity, depth, "Message queued for offline identity");
        depth
    }

    /// Remove and return an identity's whole queue. The caller owns delivery;
    /// undelivered remainders go back through [`MessageQueues::restore`].
    pub async fn take(&self, identity: &str) -> Option<VecDeque<WireMessage>> {
        self.queues.write().await.remove(identity)
    }

    /// Put undelivered messages back at the front of an identity's queue,
    /// ahead of anything enqueued while the drain was in flight.
    pub async fn restore(&self, identity: &str, mut remainder: VecDeque<WireMessage>) {
        if remainder.is_empty() {
            return;
        }
        let mut queues = self.queues.write().await;
        match queues.get_mut(identity) {
            Some(queue) => {
                while let Some(message) = remainder.pop_back() {
                    queue.push_front(message);
                }
            }
            None => {
                queues.insert(identity.to_string(), remainder);
            }
        }
    }

    pub async fn depth(&self, identity: &str) -> usize {
        self.queues
            .read()
            .await
            .get(identity)
            .map_or(0, VecDeque::len)
    }
}
