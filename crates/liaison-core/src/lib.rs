//! Liaison Core Library
//!
//! Shared functionality for liaison components:
//! - Configuration resolution and hierarchy
//! - Tracing/logging setup for binaries
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
