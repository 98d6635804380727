//! Error types for accelerator driver operations

use std::path::PathBuf;
use thiserror::Error;
use xcel_chip::{ElementType, Profile};

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, XcelError>;

/// Errors that can occur while programming or driving an accelerator
#[derive(Debug, Error)]
pub enum XcelError {
    /// Missing image or handoff, loader failure, or register layout mismatch
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// A required file does not exist
    #[error("Configuration error: cannot find {what} at {path}")]
    MissingArtifact {
        /// Kind of artifact ("bitstream", "hardware handoff")
        what: &'static str,
        /// Path that was checked
        path: PathBuf,
    },

    /// Lifecycle operation invoked before its precondition
    #[error("Not ready: {operation} requires {requires}")]
    NotReady {
        /// Operation that was attempted
        operation: &'static str,
        /// State the session must be in
        requires: &'static str,
    },

    /// `program` called on a session that is already bound
    #[error("Session already programmed with {image}")]
    AlreadyProgrammed {
        /// Image the session is bound to
        image: PathBuf,
    },

    /// Input or output lengths disagree
    #[error("Shape mismatch: {reason}")]
    Shape {
        /// Reason for failure
        reason: String,
    },

    /// Element types disagree or are unsupported
    #[error("Type mismatch: expected {expected}, got {actual}")]
    Type {
        /// Element type required
        expected: ElementType,
        /// Element type supplied
        actual: ElementType,
    },

    /// A scalar argument is out of range
    #[error("Invalid value: {reason}")]
    InvalidValue {
        /// Reason for failure
        reason: String,
    },

    /// Device-visible memory could not be provided
    #[error("Allocation of {bytes} bytes failed: {reason}")]
    Allocation {
        /// Requested size in bytes
        bytes: usize,
        /// Reason for failure
        reason: String,
    },

    /// Register name absent from the map
    #[error("Unknown register '{name}' for profile {profile}")]
    UnknownRegister {
        /// Requested name
        name: String,
        /// Profile whose map was searched
        profile: Profile,
    },

    /// Element index out of range
    #[error("Index {index} out of range (length {len})")]
    Index {
        /// Requested index
        index: usize,
        /// Buffer length
        len: usize,
    },

    /// Operation does not exist for this profile
    #[error("{operation} is not supported by profile {profile}")]
    UnsupportedOperation {
        /// Operation that was attempted
        operation: &'static str,
        /// Active profile
        profile: Profile,
    },

    /// Completion wait exceeded its deadline
    #[error("Accelerator did not signal done within {duration_ms}ms ({polls} polls)")]
    Timeout {
        /// Deadline in milliseconds
        duration_ms: u64,
        /// Control register reads performed
        polls: u64,
    },

    /// Completion wait was cancelled by the caller
    #[error("Completion wait cancelled after {polls} polls")]
    Cancelled {
        /// Control register reads performed
        polls: u64,
    },

    /// Platform register or memory access failed
    #[error("Hardware error: {reason}")]
    Hardware {
        /// Reason for failure
        reason: String,
    },

    /// I/O error while talking to the platform
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl XcelError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a missing artifact error
    pub fn missing_artifact(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact {
            what,
            path: path.into(),
        }
    }

    /// Create a not ready error
    pub const fn not_ready(operation: &'static str, requires: &'static str) -> Self {
        Self::NotReady {
            operation,
            requires,
        }
    }

    /// Create a shape error
    pub fn shape(reason: impl Into<String>) -> Self {
        Self::Shape {
            reason: reason.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// Create an allocation error
    pub fn allocation(bytes: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            bytes,
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::Hardware {
            reason: reason.into(),
        }
    }

    /// `true` for errors raised by a missing or inconsistent setup
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::MissingArtifact { .. }
        )
    }
}
