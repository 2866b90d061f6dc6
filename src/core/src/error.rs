use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Exit code reported for failures that carry no step or line position.
pub const UNPOSITIONED_EXIT_CODE: i32 = 126;

/// Why a RUN command did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The command ran and exited unsuccessfully.
    NonZeroExit,
    /// The command exceeded the configured timeout and was killed.
    TimedOut(Duration),
    /// The command could not be started or waited on.
    Spawn(String),
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::NonZeroExit => write!(f, "non-zero exit status"),
            ExecutionFailure::TimedOut(limit) => {
                write!(f, "timed out after {}s", limit.as_secs_f64())
            }
            ExecutionFailure::Spawn(message) => write!(f, "failed to spawn: {}", message),
        }
    }
}

/// Stratum build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed recipe text
    #[error("Syntax error on line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    /// Base image reference could not be resolved
    #[error("Cannot resolve base image '{reference}': {reason}")]
    BaseResolution { reference: String, reason: String },

    /// A RUN command failed
    #[error(
        "RUN failed: {reason} (exit code {}): {instruction}{}",
        exit_code_label(.exit_code),
        stderr_suffix(.stderr_excerpt)
    )]
    Execution {
        instruction: String,
        exit_code: Option<i32>,
        reason: ExecutionFailure,
        stderr_excerpt: String,
    },

    /// Cached or stored layer data does not match its recorded identity
    #[error("Cache consistency violation for layer {id}: {reason}")]
    CacheConsistency { id: String, reason: String },

    /// A recipe step failed; wraps the underlying cause
    #[error("Step {step} (line {line}) failed: {source}")]
    StepFailed {
        step: usize,
        line: usize,
        #[source]
        source: Box<BuildError>,
    },

    /// Layer store bookkeeping failed
    #[error("Layer store error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

fn stderr_suffix(excerpt: &str) -> String {
    if excerpt.is_empty() {
        String::new()
    } else {
        format!("\n{}", excerpt)
    }
}

impl BuildError {
    /// Process exit code for this error.
    ///
    /// Step failures report the 1-based step position and syntax errors report
    /// the offending line, both clamped to `1..=125`. Everything else maps to
    /// [`UNPOSITIONED_EXIT_CODE`].
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::StepFailed { step, .. } => clamp_position(*step),
            BuildError::Syntax { line, .. } => clamp_position(*line),
            _ => UNPOSITIONED_EXIT_CODE,
        }
    }

    /// The innermost error, unwrapping any step context.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn clamp_position(position: usize) -> i32 {
    position.clamp(1, 125) as i32
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, BuildError>;
