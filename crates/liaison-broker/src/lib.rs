//! Liaison broker library.
//!
//! Mediates real-time traffic between requester clients (automated agents)
//! and responder clients (interactive front-ends) over persistent
//! connections: session tracking with liveness sweeps, role-based routing
//! with store-and-forward, and the popup ask/await/resolve workflow.

pub mod broker;
pub mod connection;
pub mod events;
pub mod health;
pub mod popup;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;

pub use broker::Broker;
pub use connection::{Connection, OutboundCommand, SendError};
pub use events::EventSink;
pub use health::HealthObserver;
pub use popup::{PopupCorrelator, PopupError};
pub use registry::{RegistryError, Session, SessionRegistry, TransportMetadata};
pub use router::{MessageRouter, RouteOutcome, RouterError};
