//! In-memory session registry.
//!
//! Owns every identified client: role, metadata, activity timestamps and the
//! session's connection handle. Physical connections start as pending entries
//! and are promoted to sessions by the `identify` handshake; reconnects always
//! mint a fresh identity.

pub mod session;
pub mod sweep;

use std::sync::{Arc, OnceLock, Weak};

use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use liaison_wire::methods::{METHOD_CONNECTED, METHOD_PING};
use liaison_wire::{BrokerEvent, Role, WireMessage, unix_millis};

use crate::connection::Connection;
use crate::events::EventSink;
use crate::health::HealthObserver;
use crate::router::MessageRouter;

pub use session::{PendingConnection, Session, TransportMetadata};

/// Capabilities advertised in the `connected` acknowledgment.
pub const BROKER_CAPABILITIES: &[&str] = &["popups", "routing", "store-and-forward", "health"];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown session: {0}")]
    NotFound(String),

    #[error("Connection not alive: {0}")]
    ConnectionNotAlive(String),

    #[error("Client capacity exceeded: {active}/{max}")]
    CapacityExceeded { active: usize, max: usize },

    #[error("Send failed for session {0}")]
    SendFailure(String),
}

/// Thread-safe registry of pending connections and identified sessions.
///
/// Sessions are kept in an [`IndexMap`] so iteration order is insertion
/// order; the router's "first resolved target" rule depends on it.
pub struct SessionRegistry {
    pending: RwLock<IndexMap<String, PendingConnection>>,
    sessions: RwLock<IndexMap<String, Arc<Session>>>,
    max_clients: usize,
    events: EventSink,
    health: Arc<HealthObserver>,
    /// Router notified on every disconnect, wired once at startup.
    /// Correlation bookkeeping must never outlive its session, no matter
    /// which path evicted it (facade teardown, send failure, liveness sweep).
    router: OnceLock<Weak<MessageRouter>>,
}

impl SessionRegistry {
    pub fn new(max_clients: usize, events: EventSink, health: Arc<HealthObserver>) -> Self {
        Self {
            pending: RwLock::new(IndexMap::new()),
            sessions: RwLock::new(IndexMap::new()),
            max_clients,
            events,
            health,
            router: OnceLock::new(),
        }
    }

    /// Wire the router that observes disconnects. Call once at startup;
    /// later calls are ignored.
    pub fn attach_router(&self, router: &Arc<MessageRouter>) {
        let _ = self.router.set(Arc::downgrade(router));
    }

    /// Track a freshly accepted connection that has not identified yet.
    /// Returns the pending id the transport adapter keys the handshake on.
    pub async fn register_pending(
        &self,
        connection: Connection,
        transport: TransportMetadata,
    ) -> String {
        let id = format!("pend-{}", Uuid::new_v4());
        self.pending
            .write()
            .await
            .insert(id.clone(), PendingConnection::new(id.clone(), connection, transport));
        debug!(pending_id = %id, "Connection accepted, awaiting identify");
        id
    }

    /// Drop a pending connection whose transport closed before identifying.
    pub async fn drop_pending(&self, pending_id: &str) -> Option<PendingConnection> {
        let dropped = self.pending.write().await.shift_remove(pending_id);
        if dropped.is_some() {
            debug!(pending_id = %pending_id, "Pending connection closed before identify");
        }
        dropped
    }

    /// Promote a pending connection to an identified session.
    ///
    /// A vanished pending connection is logged and swallowed (`Ok(None)`):
    /// the peer is already gone, there is nobody to fail towards. Capacity
    /// violations are real errors and leave the pending entry removed.
    pub async fn identify(
        &self,
        pending_id: &str,
        params: &Value,
    ) -> Result<Option<Arc<Session>>, RegistryError> {
        let Some(pending) = self.pending.write().await.shift_remove(pending_id) else {
            warn!(pending_id = %pending_id, "Identify for unknown pending connection, ignoring");
            return Ok(None);
        };

        let metadata = liaison_wire::IdentifyParams::from_params(params);
        let role = metadata.role();
        let session_id = format!("s-{}", Uuid::new_v4());

        {
            let mut sessions = self.sessions.write().await;
            let active = sessions.len();
            if active >= self.max_clients {
                drop(sessions);
                warn!(
                    pending_id = %pending_id,
                    active,
                    max = self.max_clients,
                    "Rejecting identify, client capacity exceeded"
                );
                if let Err(e) = pending.connection.close().await {
                    debug!(pending_id = %pending_id, error = %e, "Close of rejected connection failed");
                }
                return Err(RegistryError::CapacityExceeded {
                    active,
                    max: self.max_clients,
                });
            }
            let session = Arc::new(Session::new(
                session_id.clone(),
                role,
                metadata,
                pending.transport,
                pending.connection,
            ));
            sessions.insert(session_id.clone(), Arc::clone(&session));
        }

        info!(session_id = %session_id, role = %role, "Client identified");
        self.events.emit(BrokerEvent::client_connected(&session_id, role));

        // Acknowledge with the assigned id and our capability list. The peer
        // may already be gone; that surfaces on the next send or sweep.
        let ack = WireMessage::notification(
            METHOD_CONNECTED,
            json!({ "sessionId": session_id, "capabilities": BROKER_CAPABILITIES }),
        );
        if let Err(e) = self.send(&session_id, ack).await {
            warn!(session_id = %session_id, error = %e, "Failed to send connected ack");
        }

        Ok(self.get(&session_id).await)
    }

    /// Tear down a session. Idempotent: disconnecting an unknown id is a
    /// no-op.
    pub async fn disconnect(&self, session_id: &str, reason: &str) {
        let Some(session) = self.sessions.write().await.shift_remove(session_id) else {
            return;
        };
        if let Err(e) = session.connection().close().await {
            debug!(session_id = %session_id, error = %e, "Error closing connection on disconnect");
        }
        info!(session_id = %session_id, reason = %reason, "Client disconnected");
        self.events
            .emit(BrokerEvent::client_disconnected(session_id, reason));
        if let Some(router) = self.router.get().and_then(Weak::upgrade) {
            router.on_client_disconnected(session_id).await;
        }
    }

    /// Point-to-point send. Failures are never swallowed: a transport-level
    /// send failure disconnects the session and propagates to the caller.
    pub async fn send(&self, session_id: &str, message: WireMessage) -> Result<(), RegistryError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        if !session.connection().is_alive() {
            self.health
                .record("send_failure", "connection not alive", Some(session_id), None)
                .await;
            return Err(RegistryError::ConnectionNotAlive(session_id.to_string()));
        }
        match session.connection().send(message).await {
            Ok(()) => {
                session.touch().await;
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Send failed, disconnecting session");
                self.health
                    .record("send_failure", &e.to_string(), Some(session_id), None)
                    .await;
                self.disconnect(session_id, "send failure").await;
                Err(RegistryError::SendFailure(session_id.to_string()))
            }
        }
    }

    /// Fan a message out to every session of a role. Per-target failures are
    /// logged and excluded from the returned id list, never fatal.
    pub async fn broadcast(&self, role: Role, message: &WireMessage) -> Vec<String> {
        let targets = self.sessions_with_role(role).await;
        let mut delivered = Vec::with_capacity(targets.len());
        for session in targets {
            match self.send(session.id(), message.clone()).await {
                Ok(()) => delivered.push(session.id().to_string()),
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Broadcast target skipped");
                }
            }
        }
        delivered
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Sessions of one role, in registration order.
    pub async fn sessions_with_role(&self, role: Role) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.role() == role)
            .cloned()
            .collect()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Record inbound activity for a session.
    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.get(session_id).await {
            session.touch().await;
        }
    }

    /// One liveness pass: sessions idle past `3 * heartbeat` are probed;
    /// dead ones are evicted, quiet-but-alive ones get a ping. The 3x margin
    /// keeps a single missed tick from evicting a healthy client.
    pub async fn sweep(&self, heartbeat: std::time::Duration) {
        let stale_after = heartbeat * 3;
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();

        for session in sessions {
            if session.idle_for().await <= stale_after {
                continue;
            }
            if session.connection().is_alive() {
                let ping = WireMessage::notification(
                    METHOD_PING,
                    json!({ "timestamp": unix_millis() }),
                );
                if let Err(e) = self.send(session.id(), ping).await {
                    warn!(session_id = %session.id(), error = %e, "Sweep ping failed");
                }
            } else {
                info!(session_id = %session.id(), "Evicting stale session");
                self.disconnect(session.id(), "stale connection").await;
            }
        }
    }
}
