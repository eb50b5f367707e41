use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::Rank;
use crate::dispatch::DispatchId;
use crate::session::SessionState;

/// Unified error type for the lockstep library
#[derive(Debug, Error)]
pub enum LockstepError {
    /// A worker received an id its function table does not hold
    #[error("Unknown dispatch id {id} (table holds {table_len} routines)")]
    UnknownDispatchId { id: DispatchId, table_len: usize },

    /// A dispatch wrapper named a routine missing from the session table
    #[error("Routine not registered: {name}")]
    UnknownRoutine { name: String },

    /// A dispatch wrapper was called at top level on a worker rank
    #[error("Dispatch wrapper {name} called directly on worker rank {rank}")]
    WrapperOnWorker { name: String, rank: Rank },

    /// A dispatched routine returned an error
    #[error("Routine {name} failed")]
    RoutineFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Table fingerprints disagree across the group
    #[error("Function table mismatch on ranks {ranks:?}")]
    TableMismatch { ranks: Vec<Rank> },

    /// Session lifecycle violated
    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Group communication errors
    #[error(transparent)]
    Comm(#[from] CommError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// YAML config parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised by a group communication channel
#[derive(Debug, Error)]
pub enum CommError {
    /// A frame arrived out of sequence; the group broadcast order has diverged
    #[error("Broadcast desync: expected sequence {expected_seq}, got {got_seq}")]
    Desync { expected_seq: u64, got_seq: u64 },

    /// A frame came from a different root than this member asked for
    #[error("Broadcast root mismatch: expected rank {expected}, got rank {got}")]
    RootMismatch { expected: Rank, got: Rank },

    #[error("Invalid root rank {root} for group of size {size}")]
    InvalidRoot { root: Rank, size: usize },

    /// Every other member has left the group
    #[error("Group channel disconnected")]
    Disconnected,

    #[error("Payload encoding failed: {0}")]
    Encode(#[from] bincode::Error),
}

/// Non-fatal findings from scanning and table construction.
///
/// Each one is a place where this process may have diverged from its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A configured root is unknown to the module source
    MissingRoot { root: String },
    /// Source text could not be read, so the marker check was bypassed
    UnreadableSource { module: String },
    /// The module could not be imported and was skipped
    ImportFailed { module: String, error: String },
    /// Two tagged routines share a name; `kept` replaced `replaced`
    NameCollision {
        name: String,
        kept: String,
        replaced: String,
    },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRoot { root } => write!(f, "scan root not found: {}", root),
            Self::UnreadableSource { module } => {
                write!(f, "source of {} unreadable, imported without marker check", module)
            }
            Self::ImportFailed { module, error } => {
                write!(f, "import of {} failed: {}", module, error)
            }
            Self::NameCollision {
                name,
                kept,
                replaced,
            } => write!(
                f,
                "parallel routine {} defined in {} and {}; keeping {}",
                name, replaced, kept, kept
            ),
        }
    }
}

impl LockstepError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Wrap a routine error
    pub fn routine_failed<S: Into<String>>(name: S, source: anyhow::Error) -> Self {
        Self::RoutineFailed {
            name: name.into(),
            source,
        }
    }

    /// Whether the rest of the group can still make progress after this error.
    ///
    /// Dispatch-level failures leave the other ranks blocked in a collective
    /// call, so they are never recoverable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Configuration { .. } | Self::Io { .. } | Self::Yaml(_) => false,
            Self::UnknownRoutine { .. } | Self::WrapperOnWorker { .. } => false,
            _ => true,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnknownDispatchId { .. } => "dispatch",
            Self::UnknownRoutine { .. } | Self::WrapperOnWorker { .. } => "wrapper",
            Self::RoutineFailed { .. } => "routine",
            Self::TableMismatch { .. } => "table",
            Self::InvalidTransition { .. } => "session",
            Self::Comm(_) => "comm",
            Self::Configuration { .. } | Self::Yaml(_) => "configuration",
            Self::Io { .. } => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LockstepError>;
