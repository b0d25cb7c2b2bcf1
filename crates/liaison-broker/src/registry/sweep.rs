//! Background liveness sweep task.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::SessionRegistry;

/// Spawn the periodic liveness sweep. Runs one [`SessionRegistry::sweep`]
/// pass per heartbeat interval until the shutdown channel flips.
pub fn spawn_sweep_task(
    registry: Arc<SessionRegistry>,
    heartbeat: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(heartbeat);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    registry.sweep(heartbeat).await;
                }
                _ = shutdown.changed() => {
                    info!("Liveness sweep shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::connection::Connection;
    use crate::events::EventSink;
    use crate::health::HealthObserver;
    use crate::registry::TransportMetadata;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_task_evicts_dead_sessions_and_stops_on_shutdown() {
        let events = EventSink::new(16);
        let health = Arc::new(HealthObserver::new(events.clone()));
        let registry = Arc::new(SessionRegistry::new(4, events, health));
        let (conn, rx) = Connection::channel(16);
        let pending_id = registry
            .register_pending(conn, TransportMetadata::default())
            .await;
        let session = registry
            .identify(&pending_id, &json!({}))
            .await
            .unwrap()
            .unwrap();
        drop(rx);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = spawn_sweep_task(
            Arc::clone(&registry),
            Duration::from_millis(10),
            shutdown_rx,
        );

        // Wait past 3x heartbeat plus a sweep tick.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.is_connected(session.id()).await);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
