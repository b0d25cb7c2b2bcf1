//! Capability-level wrapper around one physical connection.
//!
//! The transport's write half is owned by a single task draining the command
//! channel; every other component talks to the connection through this
//! handle. This is the only seam with transport access -- the registry,
//! router and correlator treat connections as opaque.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use liaison_wire::WireMessage;

/// Commands consumed by the connection's writer task.
#[derive(Debug)]
pub enum OutboundCommand {
    /// Deliver one message to the peer.
    Message(WireMessage),
    /// Answer a transport-level ping.
    Pong(Vec<u8>),
    /// Flush and close the transport.
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Connection is not alive")]
    NotAlive,
    #[error("Connection closed")]
    Closed,
}

/// Handle to one physical connection.
///
/// Cheap to clone; all clones feed the same writer task. Liveness is an
/// advisory flag cleared by the writer on transport failure or close.
#[derive(Debug, Clone)]
pub struct Connection {
    outbound: mpsc::Sender<OutboundCommand>,
    alive: Arc<AtomicBool>,
}

impl Connection {
    /// Create a connection handle together with the command receiver its
    /// writer task will drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: tx,
                alive: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Queue one message for delivery. Fails when the transport is gone;
    /// the failure is the caller's to handle, never swallowed here.
    pub async fn send(&self, message: WireMessage) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::NotAlive);
        }
        self.outbound
            .send(OutboundCommand::Message(message))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Ask the writer task to flush and close the transport.
    pub async fn close(&self) -> Result<(), SendError> {
        self.alive.store(false, Ordering::Relaxed);
        self.outbound
            .send(OutboundCommand::Close)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Answer a transport ping. Best-effort; a dead writer means the
    /// connection is about to be torn down anyway.
    pub async fn pong(&self, payload: Vec<u8>) -> Result<(), SendError> {
        self.outbound
            .send(OutboundCommand::Pong(payload))
            .await
            .map_err(|_| SendError::Closed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed) && !self.outbound.is_closed()
    }

    /// Shared liveness flag, handed to the writer task so it can mark the
    /// connection dead on transport failure.
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.alive)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use liaison_wire::methods::METHOD_PING;
    use serde_json::json;

    #[tokio::test]
    async fn send_delivers_to_the_writer_channel() {
        let (conn, mut rx) = Connection::channel(16);
        conn.send(WireMessage::notification(METHOD_PING, json!({})))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(OutboundCommand::Message(_))));
    }

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (conn, rx) = Connection::channel(16);
        drop(rx);
        let err = conn
            .send(WireMessage::notification(METHOD_PING, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::NotAlive | SendError::Closed));
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn close_marks_the_connection_dead() {
        let (conn, mut rx) = Connection::channel(16);
        conn.close().await.unwrap();
        assert!(!conn.is_alive());
        assert!(matches!(rx.recv().await, Some(OutboundCommand::Close)));
        assert!(conn
            .send(WireMessage::notification(METHOD_PING, json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn liveness_flag_is_shared_with_the_writer() {
        let (conn, _rx) = Connection::channel(16);
        let alive = conn.liveness();
        assert!(conn.is_alive());
        alive.store(false, Ordering::Relaxed);
        assert!(!conn.is_alive());
    }
}
