//! Health observer: rolling error window and coarse status.
//!
//! Purely observational. Components report failures here; the observer
//! thresholds the recent count into healthy/degraded/unhealthy and emits a
//! change event on every transition. It never feeds back into routing or
//! correlation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use liaison_wire::{BrokerEvent, HealthStatus, unix_millis};

use crate::events::EventSink;

/// Errors inside this window count towards the status thresholds.
pub const ERROR_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Rolling buffer bound; the oldest record is dropped past this.
pub const MAX_RECORDS: usize = 100;
const DEGRADED_THRESHOLD: usize = 5;
const UNHEALTHY_THRESHOLD: usize = 10;

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub timestamp_ms: u64,
    #[serde(skip)]
    recorded_at: Instant,
}

pub struct HealthObserver {
    errors: RwLock<VecDeque<ErrorRecord>>,
    status: RwLock<HealthStatus>,
    memory_pressure: AtomicBool,
    window: Duration,
    max_records: usize,
    events: EventSink,
}

impl HealthObserver {
    pub fn new(events: EventSink) -> Self {
        Self {
            errors: RwLock::new(VecDeque::new()),
            status: RwLock::new(HealthStatus::Healthy),
            memory_pressure: AtomicBool::new(false),
            window: ERROR_WINDOW,
            max_records: MAX_RECORDS,
            events,
        }
    }

    /// Record one failure and recompute the status.
    pub async fn record(
        &self,
        kind: &str,
        message: &str,
        session_id: Option<&str>,
        cause: Option<&str>,
    ) {
        let record = ErrorRecord {
            kind: kind.to_string(),
            message: message.to_string(),
            session_id: session_id.map(ToOwned::to_owned),
            cause: cause.map(ToOwned::to_owned),
            timestamp_ms: unix_millis(),
            recorded_at: Instant::now(),
        };
        self.events.emit(BrokerEvent::error_occurred(kind, message, session_id));

        {
            let mut errors = self.errors.write().await;
            if errors.len() >= self.max_records {
                errors.pop_front();
            }
            errors.push_back(record);
        }
        self.recompute().await;
    }

    /// Signal from an external collaborator that memory is tight. Drives the
    /// degraded threshold; the broker has no process-memory probe of its own.
    pub async fn set_memory_pressure(&self, pressure: bool) {
        self.memory_pressure.store(pressure, Ordering::Relaxed);
        self.recompute().await;
    }

    pub async fn status(&self) -> HealthStatus {
        *self.status.read().await
    }

    /// Snapshot of the rolling error buffer, oldest first.
    pub async fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors.read().await.iter().cloned().collect()
    }

    /// Re-threshold the recent error count. Runs after every record and on
    /// the periodic tick so the status also decays back to healthy.
    pub async fn recompute(&self) {
        let recent = {
            let errors = self.errors.read().await;
            errors
                .iter()
                .filter(|e| e.recorded_at.elapsed() <= self.window)
                .count()
        };

        let current = if recent > UNHEALTHY_THRESHOLD {
            HealthStatus::Unhealthy
        } else if recent > DEGRADED_THRESHOLD || self.memory_pressure.load(Ordering::Relaxed) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let previous = {
            let mut status = self.status.write().await;
            let previous = *status;
            *status = current;
            previous
        };
        if previous != current {
            if current == HealthStatus::Healthy {
                info!(previous = %previous, current = %current, "Broker health recovered");
            } else {
                warn!(previous = %previous, current = %current, recent, "Broker health changed");
            }
            self.events.emit(BrokerEvent::status_changed(previous, current));
        }
    }
}

/// Spawn the periodic recompute so the status decays once the error window
/// slides past old records.
pub fn spawn_recompute_task(
    observer: std::sync::Arc<HealthObserver>,
    period: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    observer.recompute().await;
                }
                _ = shutdown.changed() => {
                    info!("Health recompute task shutting down");
                    return;
                }
            }
        }
    })
}
