//! Error types for the sync engine.

use crate::fsm::FsmError;
use groupsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Temporary failure; retried until the budget runs out.
    #[error("temporary failure: {0}")]
    TempFail(String),

    /// Permanent failure of the current round trip.
    #[error("hard failure: {0}")]
    HardFail(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFail(String),

    /// The server requires the device policy flow.
    #[error("device must be re-provisioned")]
    ReProvision,

    /// The endpoint must be rediscovered.
    #[error("server must be rediscovered: {0}")]
    Rediscover(String),

    /// The folder hierarchy must be re-derived.
    #[error("folder hierarchy resync required: {0}")]
    Resync(String),

    /// A state machine table failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An event arrived in a state that declares it impossible.
    #[error("invalid event {event} in state {state} of {machine}")]
    InvalidEvent {
        /// Machine name.
        machine: String,
        /// State name.
        state: String,
        /// Event name.
        event: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed or unexpected document.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Item store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Work was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::TempFail(_) => true,
            _ => false,
        }
    }

    /// Returns true if the user has to do something before the account can
    /// make progress again.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            SyncError::AuthFail(_) | SyncError::ReProvision | SyncError::Rediscover(_)
        )
    }
}

impl From<FsmError> for SyncError {
    fn from(err: FsmError) -> Self {
        match err {
            FsmError::InvalidEvent {
                machine,
                state,
                event,
            } => SyncError::InvalidEvent {
                machine,
                state,
                event,
            },
            other => SyncError::Configuration(other.to_string()),
        }
    }
}
