//! Popup correlation: the ask/await/resolve protocol.
//!
//! A popup is one correlated exchange: a requester asks, a responder
//! eventually answers, and any number of callers can block on the outcome.
//! Interactions transition out of `pending` exactly once, into `resolved`,
//! `cancelled` or `timed-out`; terminal records linger for a grace window so
//! late queries still see them, then get purged.

pub mod waiters;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use liaison_wire::methods::METHOD_POPUP_REQUEST;
use liaison_wire::{BrokerEvent, PopupStatus, WireMessage, unix_millis};

use crate::events::EventSink;
use crate::router::MessageRouter;

pub use waiters::{Outcome, WaiterRegistry, WaiterToken};

/// How long a terminal interaction stays queryable before it is purged.
pub const RETENTION_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum PopupError {
    #[error("Unknown popup: {0}")]
    NotFound(String),

    #[error("Popup {id} is {status}, not pending")]
    InvalidState { id: String, status: PopupStatus },

    #[error("Timed out waiting for popup outcome")]
    Timeout,
}

/// One correlated ask/result exchange.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub id: String,
    pub requester_id: String,
    pub responder_id: String,
    pub options: Value,
    pub status: PopupStatus,
    pub created_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
    pub result: Option<Value>,
}

pub struct PopupCorrelator {
    interactions: Arc<RwLock<HashMap<String, Interaction>>>,
    waiters: WaiterRegistry,
    /// Hard-timeout tasks per pending popup; aborted when a terminal
    /// transition wins the race.
    timeouts: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
    retention: Duration,
    router: Arc<MessageRouter>,
    events: EventSink,
}

impl PopupCorrelator {
    pub fn new(router: Arc<MessageRouter>, events: EventSink) -> Self {
        Self::with_retention(router, events, RETENTION_GRACE)
    }

    pub fn with_retention(
        router: Arc<MessageRouter>,
        events: EventSink,
        retention: Duration,
    ) -> Self {
        Self {
            interactions: Arc::new(RwLock::new(HashMap::new())),
            waiters: WaiterRegistry::new(),
            timeouts: RwLock::new(HashMap::new()),
            retention,
            router,
            events,
        }
    }

    /// Open a popup and dispatch the ask towards its responder. Returns the
    /// popup id immediately; delivery (or queueing, for an offline
    /// responder) and resolution happen on their own schedules.
    pub async fn create(
        self: &Arc<Self>,
        requester_id: &str,
        responder_id: &str,
        options: Value,
        timeout: Option<Duration>,
    ) -> String {
        let popup_id = format!("popup-{}", Uuid::new_v4());
        let interaction = Interaction {
            id: popup_id.clone(),
            requester_id: requester_id.to_string(),
            responder_id: responder_id.to_string(),
            options: options.clone(),
            status: PopupStatus::Pending,
            created_at_ms: unix_millis(),
            resolved_at_ms: None,
            result: None,
        };
        self.interactions
            .write()
            .await
            .insert(popup_id.clone(), interaction);

        info!(
            popup_id = %popup_id,
            requester_id = %requester_id,
            responder_id = %responder_id,
            "Popup created"
        );
        self.events
            .emit(BrokerEvent::popup_created(&popup_id, requester_id, responder_id));

        if let Some(timeout) = timeout {
            let correlator = Arc::clone(self);
            let id = popup_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // Drop our own handle first so force_timeout cannot abort the
                // very task running it.
                correlator.timeouts.write().await.remove(&id);
                correlator.force_timeout(&id).await;
            });
            self.timeouts.write().await.insert(popup_id.clone(), handle);
        }

        let ask = WireMessage::request(&popup_id, METHOD_POPUP_REQUEST, options);
        match self.router.deliver_to(responder_id, ask).await {
            Ok(outcome) => {
                debug!(popup_id = %popup_id, ?outcome, "Popup ask dispatched");
            }
            Err(e) => {
                warn!(popup_id = %popup_id, error = %e, "Failed to dispatch popup ask");
            }
        }

        popup_id
    }

    /// Resolve a pending popup with a genuine responder result.
    pub async fn resolve(&self, popup_id: &str, result: Value) -> Result<(), PopupError> {
        self.complete(popup_id, PopupStatus::Resolved, result).await
    }

    /// Withdraw a pending popup. Id-specific waiters get the cancellation
    /// marker; "any" waiters are left alone, a cancellation is not a
    /// response.
    pub async fn cancel(&self, popup_id: &str) -> Result<(), PopupError> {
        self.complete(popup_id, PopupStatus::Cancelled, json!({ "cancelled": true }))
            .await
    }

    /// Cancel every pending popup, optionally only those targeting one
    /// responder. Best-effort: failures are logged and excluded from the
    /// returned id list.
    pub async fn close_all(&self, responder_id: Option<&str>) -> Vec<String> {
        let candidates: Vec<String> = self
            .interactions
            .read()
            .await
            .values()
            .filter(|i| i.status == PopupStatus::Pending)
            .filter(|i| responder_id.is_none_or(|r| i.responder_id == r))
            .map(|i| i.id.clone())
            .collect();

        let mut cancelled = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.cancel(&id).await {
                Ok(()) => cancelled.push(id),
                Err(e) => warn!(popup_id = %id, error = %e, "close_all skipped popup"),
            }
        }
        cancelled
    }

    /// Block until a popup reaches a terminal state, or until `timeout`.
    ///
    /// An already-terminal popup answers immediately. The deadline and the
    /// resolution path race exactly once per waiter: whichever removes the
    /// waiter's sender first wins, the loser observes the removal and steps
    /// aside.
    pub async fn await_result(
        &self,
        popup_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Outcome, PopupError> {
        if let Some(outcome) = self.terminal_outcome(popup_id).await? {
            return Ok(outcome);
        }

        let (token, mut rx) = self.waiters.register(popup_id).await;

        // Re-check: a resolution may have slipped between the status check
        // and the registration.
        match self.terminal_outcome(popup_id).await {
            Ok(Some(outcome)) => {
                if self.waiters.withdraw(popup_id, token).await {
                    return Ok(outcome);
                }
                // The release claimed our waiter; the outcome is in the
                // channel below.
            }
            Ok(None) => {}
            Err(_) => {} // purged mid-registration; the channel decides
        }

        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, &mut rx).await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Err(PopupError::NotFound(popup_id.to_string())),
                Err(_) => {
                    if self.waiters.withdraw(popup_id, token).await {
                        Err(PopupError::Timeout)
                    } else {
                        // Lost the race to a resolution that fired at the
                        // deadline; take the outcome it delivered.
                        rx.try_recv()
                            .map_err(|_| PopupError::NotFound(popup_id.to_string()))
                    }
                }
            },
            None => rx
                .await
                .map_err(|_| PopupError::NotFound(popup_id.to_string())),
        }
    }

    /// Block until the next genuine resolution of any popup, or until
    /// `timeout`. Cancellations never satisfy an "any" waiter.
    pub async fn await_any(&self, timeout: Option<Duration>) -> Result<Outcome, PopupError> {
        let (token, mut rx) = self.waiters.register_any().await;
        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, &mut rx).await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Err(PopupError::Timeout),
                Err(_) => {
                    if self.waiters.withdraw_any(token).await {
                        Err(PopupError::Timeout)
                    } else {
                        rx.try_recv().map_err(|_| PopupError::Timeout)
                    }
                }
            },
            None => rx.await.map_err(|_| PopupError::Timeout),
        }
    }

    pub async fn get(&self, popup_id: &str) -> Option<Interaction> {
        self.interactions.read().await.get(popup_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.interactions
            .read()
            .await
            .values()
            .filter(|i| i.status == PopupStatus::Pending)
            .count()
    }

    async fn terminal_outcome(&self, popup_id: &str) -> Result<Option<Outcome>, PopupError> {
        let interactions = self.interactions.read().await;
        let interaction = interactions
            .get(popup_id)
            .ok_or_else(|| PopupError::NotFound(popup_id.to_string()))?;
        if interaction.status.is_terminal() {
            let result = interaction.result.clone().unwrap_or(Value::Null);
            Ok(Some((interaction.status, result)))
        } else {
            Ok(None)
        }
    }

    /// The single terminal transition. Releases id waiters for every
    /// terminal state; releases one "any" waiter only for genuine outcomes
    /// (resolved, timed-out), never for cancellation.
    async fn complete(
        &self,
        popup_id: &str,
        status: PopupStatus,
        result: Value,
    ) -> Result<(), PopupError> {
        {
            let mut interactions = self.interactions.write().await;
            let interaction = interactions
                .get_mut(popup_id)
                .ok_or_else(|| PopupError::NotFound(popup_id.to_string()))?;
            if interaction.status.is_terminal() {
                return Err(PopupError::InvalidState {
                    id: popup_id.to_string(),
                    status: interaction.status,
                });
            }
            interaction.status = status;
            interaction.resolved_at_ms = Some(unix_millis());
            interaction.result = Some(result.clone());
        }

        if let Some(handle) = self.timeouts.write().await.remove(popup_id) {
            handle.abort();
        }

        let outcome: Outcome = (status, result);
        let released = self.waiters.release(popup_id, &outcome).await;
        let any_released = if matches!(status, PopupStatus::Resolved | PopupStatus::TimedOut) {
            self.waiters.release_one_any(&outcome).await
        } else {
            false
        };

        info!(
            popup_id = %popup_id,
            status = %status,
            released,
            any_released,
            "Popup reached terminal state"
        );
        self.events.emit(BrokerEvent::popup_resolved(popup_id, status));

        // Retain the terminal record for late queries, then purge.
        let interactions = Arc::clone(&self.interactions);
        let id = popup_id.to_string();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if interactions.write().await.remove(&id).is_some() {
                debug!(popup_id = %id, "Terminal popup purged after retention window");
            }
        });

        Ok(())
    }

    /// Hard-timeout path: a popup that never got an answer. Behaves like a
    /// resolution for waiter release, carrying the timed-out marker.
    async fn force_timeout(&self, popup_id: &str) {
        match self
            .complete(popup_id, PopupStatus::TimedOut, json!({ "timedOut": true }))
            .await
        {
            Ok(()) => warn!(popup_id = %popup_id, "Popup timed out unanswered"),
            // Lost the race to resolve/cancel; nothing to do.
            Err(PopupError::InvalidState { .. } | PopupError::NotFound(_)) => {}
            Err(e) => warn!(popup_id = %popup_id, error = %e, "Popup timeout failed"),
        }
    }
}
