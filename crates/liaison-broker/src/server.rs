//! WebSocket transport adapter.
//!
//! Accept loop plus per-socket reader/writer tasks. The writer task
//! exclusively owns the sink and drains the connection's command channel, so
//! every outbound frame to one peer serializes through one place. The
//! adapter carries no routing or correlation logic; it only feeds frames
//! into the [`Broker`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{debug, info, warn};

use liaison_wire::WireMessage;

use crate::broker::Broker;
use crate::connection::{Connection, OutboundCommand};
use crate::registry::TransportMetadata;

/// Outbound command channel depth per connection.
const OUTBOUND_CAPACITY: usize = 64;

/// Accept connections until the shutdown channel flips.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = accepted?;
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    if let Err(e) = handle_socket(stream, remote_addr.to_string(), broker).await {
                        debug!(remote_addr = %remote_addr, error = %e, "Connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    remote_addr: String,
    broker: Arc<Broker>,
) -> anyhow::Result<()> {
    // Capture the User-Agent during the HTTP upgrade.
    let mut user_agent = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        user_agent = request
            .headers()
            .get("User-Agent")
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        Ok(response)
    })
    .await?;
    let (mut sink, mut source) = ws.split();

    let (connection, mut outbound_rx) = Connection::channel(OUTBOUND_CAPACITY);
    let alive = connection.liveness();

    // Writer task: sole owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            let result = match command {
                OutboundCommand::Message(message) => {
                    sink.send(Message::text(message.to_text())).await
                }
                OutboundCommand::Pong(payload) => sink.send(Message::Pong(payload.into())).await,
                OutboundCommand::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.flush().await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!(error = %e, "Transport write failed, stopping writer");
                break;
            }
        }
        alive.store(false, Ordering::Relaxed);
    });

    let transport = TransportMetadata {
        remote_addr: Some(remote_addr.clone()),
        user_agent,
    };
    let pending_id = broker.accept(connection.clone(), transport).await;
    debug!(remote_addr = %remote_addr, pending_id = %pending_id, "WebSocket connection established");

    let mut session_id: Option<String> = None;
    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(remote_addr = %remote_addr, error = %e, "Transport read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                let message = match WireMessage::parse(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(remote_addr = %remote_addr, error = %e, "Dropping unparseable frame");
                        continue;
                    }
                };
                match &session_id {
                    Some(id) => broker.handle_message(id, message).await,
                    None => match broker.handle_identify(&pending_id, &message).await {
                        Ok(Some(session)) => session_id = Some(session.id().to_string()),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(remote_addr = %remote_addr, error = %e, "Identify rejected");
                            break;
                        }
                    },
                }
            }
            Message::Ping(payload) => {
                if connection.pong(payload.into()).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    // Reader teardown: the session (or the still-pending entry) goes away.
    match session_id {
        Some(id) => broker.handle_disconnect(&id, "connection closed").await,
        None => broker.abandon_pending(&pending_id).await,
    }
    drop(writer);
    Ok(())
}
