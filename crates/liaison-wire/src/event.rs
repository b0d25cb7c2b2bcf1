//! Typed events emitted by the broker for external observers.

use serde::Serialize;

use crate::identify::Role;

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Lifecycle state of a popup interaction.
///
/// Transitions happen only out of [`PopupStatus::Pending`]; the other three
/// states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PopupStatus {
    Pending,
    Resolved,
    Cancelled,
    TimedOut,
}

impl PopupStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed-out",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for PopupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse broker health derived from the recent error window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observable broker occurrence, timestamped at creation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    ClientConnected {
        timestamp_ms: u64,
        session_id: String,
        role: Role,
    },
    ClientDisconnected {
        timestamp_ms: u64,
        session_id: String,
        reason: String,
    },
    PopupCreated {
        timestamp_ms: u64,
        popup_id: String,
        requester_id: String,
        responder_id: String,
    },
    PopupResolved {
        timestamp_ms: u64,
        popup_id: String,
        status: PopupStatus,
    },
    StatusChanged {
        timestamp_ms: u64,
        previous: HealthStatus,
        current: HealthStatus,
    },
    ErrorOccurred {
        timestamp_ms: u64,
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl BrokerEvent {
    pub fn client_connected(session_id: &str, role: Role) -> Self {
        Self::ClientConnected {
            timestamp_ms: unix_millis(),
            session_id: session_id.to_string(),
            role,
        }
    }

    pub fn client_disconnected(session_id: &str, reason: &str) -> Self {
        Self::ClientDisconnected {
            timestamp_ms: unix_millis(),
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn popup_created(popup_id: &str, requester_id: &str, responder_id: &str) -> Self {
        Self::PopupCreated {
            timestamp_ms: unix_millis(),
            popup_id: popup_id.to_string(),
            requester_id: requester_id.to_string(),
            responder_id: responder_id.to_string(),
        }
    }

    pub fn popup_resolved(popup_id: &str, status: PopupStatus) -> Self {
        Self::PopupResolved {
            timestamp_ms: unix_millis(),
            popup_id: popup_id.to_string(),
            status,
        }
    }

    pub fn status_changed(previous: HealthStatus, current: HealthStatus) -> Self {
        Self::StatusChanged {
            timestamp_ms: unix_millis(),
            previous,
            current,
        }
    }

    pub fn error_occurred(kind: &str, message: &str, session_id: Option<&str>) -> Self {
        Self::ErrorOccurred {
            timestamp_ms: unix_millis(),
            kind: kind.to_string(),
            message: message.to_string(),
            session_id: session_id.map(ToOwned::to_owned),
        }
    }
}
