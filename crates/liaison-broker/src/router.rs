//! Role-based message router with store-and-forward.
//!
//! Targets are resolved purely from the sender's role: requester traffic
//! goes to responders and vice versa, never by message content. Requests go
//! to exactly one target; responses and notifications fan out, except that a
//! response whose correlation id matches recorded bookkeeping is returned
//! point-to-point to the request's origin.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use liaison_wire::{MessageKind, Role, WireMessage};

use crate::queue::MessageQueues;
use crate::registry::{RegistryError, SessionRegistry};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No {0} available to receive the message")]
    NoTargetAvailable(Role),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Where one routed message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to one connected target.
    Delivered(String),
    /// Target identity is offline; held in its queue for reconnect.
    /// Retryable, not a hard failure.
    ClientQueued(String),
    /// Fanned out; carries the count of successful deliveries.
    Broadcast(usize),
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    queues: MessageQueues,
    /// Correlation id of each in-flight request, mapped to the session that
    /// sent it.
    correlations: RwLock<HashMap<String, String>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            queues: MessageQueues::new(),
            correlations: RwLock::new(HashMap::new()),
        }
    }

    /// Route one client message by the sender's role.
    pub async fn route(
        &self,
        sender_id: &str,
        sender_role: Role,
        message: WireMessage,
    ) -> Result<RouteOutcome, RouterError> {
        let target_role = sender_role.counterpart();
        match message.kind() {
            MessageKind::Request => self.route_request(sender_id, target_role, message).await,
            MessageKind::Response => self.route_response(target_role, message).await,
            MessageKind::Notification => Ok(self.fan_out(target_role, &message).await),
        }
    }

    /// Deliver to a specific identity, queueing when it is offline.
    ///
    /// A send failure against a connected target propagates: the registry
    /// has already disconnected the session by the time we see it.
    pub async fn deliver_to(
        &self,
        identity: &str,
        message: WireMessage,
    ) -> Result<RouteOutcome, RouterError> {
        if self.registry.is_connected(identity).await {
            match self.registry.send(identity, message.clone()).await {
                Ok(()) => return Ok(RouteOutcome::Delivered(identity.to_string())),
                Err(RegistryError::NotFound(_)) => {} // raced a disconnect, fall through to queue
                Err(e) => return Err(e.into()),
            }
        }
        self.queues.enqueue(identity, message).await;
        Ok(RouteOutcome::ClientQueued(identity.to_string()))
    }

    async fn route_request(
        &self,
        sender_id: &str,
        target_role: Role,
        message: WireMessage,
    ) -> Result<RouteOutcome, RouterError> {
        let targets = self.registry.sessions_with_role(target_role).await;
        let Some(target) = targets.first() else {
            return Err(RouterError::NoTargetAvailable(target_role));
        };

        // Record the correlation before sending so a fast response cannot
        // miss it.
        if let Some(correlation_id) = message.id() {
            self.correlations
                .write()
                .await
                .insert(correlation_id, sender_id.to_string());
        }

        self.registry.send(target.id(), message).await?;
        debug!(
            sender_id = %sender_id,
            target_id = %target.id(),
            "Request routed"
        );
        Ok(RouteOutcome::Delivered(target.id().to_string()))
    }

    async fn route_response(
        &self,
        target_role: Role,
        message: WireMessage,
    ) -> Result<RouteOutcome, RouterError> {
        if let Some(correlation_id) = message.id() {
            let origin = self.correlations.write().await.remove(&correlation_id);
            if let Some(origin_id) = origin {
                debug!(
                    correlation_id = %correlation_id,
                    origin_id = %origin_id,
                    "Response returned to request origin"
                );
                return self.deliver_to(&origin_id, message).await;
            }
        }
        Ok(self.fan_out(target_role, &message).await)
    }

    async fn fan_out(&self, target_role: Role, message: &WireMessage) -> RouteOutcome {
        let delivered = self.registry.broadcast(target_role, message).await;
        RouteOutcome::Broadcast(delivered.len())
    }

    /// Replay an identity's queue after it connects. Delivery stops at the
    /// first failure; everything unsent (the failed message included) stays
    /// queued for the next reconnect.
    pub async fn on_client_connected(&self, session_id: &str) {
        let Some(mut queue) = self.queues.take(session_id).await else {
            return;
        };
        let total = queue.len();
        let mut sent = 0usize;
        while let Some(message) = queue.pop_front() {
            if let Err(e) = self.registry.send(session_id, message.clone()).await {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    sent,
                    remaining = total - sent,
                    "Queue drain interrupted, remainder preserved"
                );
                queue.push_front(message);
                break;
            }
            sent += 1;
        }
        self.queues.restore(session_id, queue).await;
        if sent > 0 {
            info!(session_id = %session_id, count = sent, "Queued messages replayed");
        }
    }

    /// Forget in-flight correlation bookkeeping for a departed identity.
    /// Its queue is deliberately left in place for a same-identity reconnect.
    pub async fn on_client_disconnected(&self, session_id: &str) {
        let mut correlations = self.correlations.write().await;
        let before = correlations.len();
        correlations.retain(|_, origin| origin != session_id);
        let dropped = before - correlations.len();
        if dropped > 0 {
            debug!(session_id = %session_id, dropped, "Dropped correlations for departed client");
        }
    }

    pub async fn queued_count(&self, identity: &str) -> usize {
        self.queues.depth(identity).await
    }
}
