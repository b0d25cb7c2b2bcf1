//! Waiter bookkeeping for popup outcomes.
//!
//! Fulfillment is exactly-once by construction: a waiter's `oneshot` sender
//! is *removed* from the collection by whichever path claims it first (the
//! deadline or the resolution), and the loser's removal comes back empty.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{RwLock, oneshot};

use liaison_wire::PopupStatus;

/// What a released waiter receives: the popup's terminal status and its
/// result payload.
pub type Outcome = (PopupStatus, Value);

/// Token identifying one registered waiter, used by the deadline path to
/// withdraw exactly its own entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterToken(u64);

#[derive(Default)]
pub struct WaiterRegistry {
    next_token: AtomicU64,
    /// Per-popup waiters, in registration order.
    by_popup: RwLock<HashMap<String, Vec<(WaiterToken, oneshot::Sender<Outcome>)>>>,
    /// "Any" waiters, released one per genuine resolution, oldest first.
    any: RwLock<VecDeque<(WaiterToken, oneshot::Sender<Outcome>)>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self) -> WaiterToken {
        WaiterToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a waiter for one popup's outcome.
    pub async fn register(&self, popup_id: &str) -> (WaiterToken, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let token = self.token();
        self.by_popup
            .write()
            .await
            .entry(popup_id.to_string())
            .or_default()
            .push((token, tx));
        (token, rx)
    }

    /// Withdraw a popup waiter. Returns `false` when a release already
    /// claimed it, in which case its receiver holds the outcome.
    pub async fn withdraw(&self, popup_id: &str, token: WaiterToken) -> bool {
        let mut by_popup = self.by_popup.write().await;
        let Some(waiters) = by_popup.get_mut(popup_id) else {
            return false;
        };
        let before = waiters.len();
        waiters.retain(|(t, _)| *t != token);
        let removed = waiters.len() < before;
        if waiters.is_empty() {
            by_popup.remove(popup_id);
        }
        removed
    }

    /// Release every waiter registered for a popup, in registration order.
    /// Returns the number released.
    ///
    /// The sends happen under the map lock: a `withdraw` that observes the
    /// removal is guaranteed to find the outcome already in its receiver.
    pub async fn release(&self, popup_id: &str, outcome: &Outcome) -> usize {
        let mut by_popup = self.by_popup.write().await;
        let Some(waiters) = by_popup.remove(popup_id) else {
            return 0;
        };
        let mut released = 0;
        for (_, tx) in waiters {
            if tx.send(outcome.clone()).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Register a waiter for the next genuine resolution of any popup.
    pub async fn register_any(&self) -> (WaiterToken, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let token = self.token();
        self.any.write().await.push_back((token, tx));
        (token, rx)
    }

    /// Withdraw an "any" waiter; same contract as [`WaiterRegistry::withdraw`].
    pub async fn withdraw_any(&self, token: WaiterToken) -> bool {
        let mut any = self.any.write().await;
        let before = any.len();
        any.retain(|(t, _)| *t != token);
        any.len() < before
    }

    /// Release at most one "any" waiter, oldest-registered-first. Waiters
    /// whose receiver is already gone are discarded and the next one tried.
    pub async fn release_one_any(&self, outcome: &Outcome) -> bool {
        let mut any = self.any.write().await;
        while let Some((_, tx)) = any.pop_front() {
            if tx.send(outcome.clone()).is_ok() {
                return true;
            }
        }
        false
    }

    pub async fn waiting_count(&self, popup_id: &str) -> usize {
        self.by_popup.read().await.get(popup_id).map_or(0, Vec::len)
    }

    pub async fn any_count(&self) -> usize {
        self.any.read().await.len()
    }
}
