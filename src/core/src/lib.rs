//! Stratum Core - Shared Types
//!
//! Error, configuration, and version types used by the stratum build
//! runtime and command-line interface.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BuilderConfig, Isolation, LogLevel};
pub use error::{BuildError, ExecutionFailure, Result};

/// Stratum version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
