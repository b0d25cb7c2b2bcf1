//! Wire-level message schema shared by the liaison broker and its clients.
//!
//! Provides:
//! - Classification of inbound JSON into request / response / notification
//! - The `identify` handshake payload and role derivation
//! - Named method constants
//! - Typed broker events for external observers

pub mod event;
pub mod identify;
pub mod message;
pub mod methods;

pub use event::{BrokerEvent, HealthStatus, PopupStatus, unix_millis};
pub use identify::{IdentifyParams, Role};
pub use message::{MessageKind, WireError, WireMessage};
