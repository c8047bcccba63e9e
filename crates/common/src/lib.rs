//! ChatRelay common library
//!
//! This crate contains the configuration, error and metrics code shared by
//! the relay worker and its tests.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use self::config::RelayConfig;
pub use error::{RelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
