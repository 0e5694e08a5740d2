//! Arena tracker error types

use crate::arena::ArenaHandle;
use thiserror::Error;

/// Arena tracker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// Reservation cannot grow to satisfy the request.
    /// The arena stays usable.
    #[error("Out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },

    /// Handle refers to a destroyed or never-created arena
    #[error("Unknown arena: {handle}")]
    UnknownArena { handle: ArenaHandle },

    /// Internal bookkeeping no longer adds up
    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// Configuration rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ArenaError {
    /// Whether the caller may retry the operation later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

/// Result type for arena operations
pub type ArenaResult<T> = Result<T, ArenaError>;
