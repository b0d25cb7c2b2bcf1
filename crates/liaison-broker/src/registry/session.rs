//! Session and pending-connection state.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use liaison_wire::{IdentifyParams, Role, unix_millis};

use crate::connection::Connection;

/// Transport-level facts about a connection, captured at accept time.
#[derive(Debug, Clone, Default)]
pub struct TransportMetadata {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

/// A physical connection that has not yet identified itself.
#[derive(Debug)]
pub struct PendingConnection {
    pub id: String,
    pub connection: Connection,
    pub transport: TransportMetadata,
    pub opened_at_ms: u64,
}

impl PendingConnection {
    pub fn new(id: String, connection: Connection, transport: TransportMetadata) -> Self {
        Self {
            id,
            connection,
            transport,
            opened_at_ms: unix_millis(),
        }
    }
}

/// One identified client.
///
/// The session exclusively owns its connection handle and closes it on
/// teardown. Identity is broker-assigned and never reused; a reconnecting
/// client becomes a new session.
#[derive(Debug)]
pub struct Session {
    id: String,
    role: Role,
    metadata: IdentifyParams,
    transport: TransportMetadata,
    connection: Connection,
    connected_at_ms: u64,
    last_activity: RwLock<Instant>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        metadata: IdentifyParams,
        transport: TransportMetadata,
        connection: Connection,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            metadata,
            transport,
            connection,
            connected_at_ms: unix_millis(),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn metadata(&self) -> &IdentifyParams {
        &self.metadata
    }

    pub const fn transport(&self) -> &TransportMetadata {
        &self.transport
    }

    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    pub const fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    /// Record activity: called on every inbound message and every
    /// successful outbound send.
    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// How long this session has been quiet.
    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }
}
