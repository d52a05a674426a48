//! Error types and handling for the weft runtime

use thiserror::Error;

use crate::guid::Guid;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, WeftError>;

/// Short error codes surfaced at the API boundary.
///
/// Transient codes (`EAGAIN`, `EBUSY`, `EINTR`) invite a retry; structural
/// codes (`ENOMEM`) abort the runtime on first occurrence; `EINVAL` and
/// `EPERM` are caller bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Malformed API call (impossible at this state)
    Einval = 1,
    /// Structural capacity exhaustion
    Enomem = 2,
    /// Transient contention, retry later
    Eagain = 3,
    /// Resource busy, retry later
    Ebusy = 4,
    /// Operation forbidden by current ownership
    Eperm = 5,
    /// Partial result, caller may reissue
    Eintr = 6,
}

/// Main error type for the weft runtime
#[derive(Error, Debug)]
pub enum WeftError {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A handle did not resolve to a live object
    #[error("Unresolved handle {guid:?}: {message}")]
    UnresolvedGuid {
        /// The handle that failed to resolve
        guid: Guid,
        /// What went wrong during resolution
        message: String,
    },

    /// A handle resolved to an object of the wrong kind
    #[error("Handle {guid:?} is a {actual}, expected {expected}")]
    GuidKindMismatch {
        /// The offending handle
        guid: Guid,
        /// Kind the object actually has
        actual: &'static str,
        /// Kind the caller required
        expected: &'static str,
    },

    /// Slot queue cannot make progress right now
    #[error("Slot queue contended or full")]
    QueueContended,

    /// Slot queue has zero capacity
    #[error("Slot queue has zero capacity")]
    QueueZeroCapacity,

    /// Slot operation attempted from the wrong state or owner
    #[error("Slot {slot} not owned in the required state")]
    SlotNotOwned {
        /// Slot index the caller presented
        slot: usize,
    },

    /// No outbound route to the requested location
    #[error("No route to location {location}")]
    NoRoute {
        /// Target location that has no outbound queue
        location: u64,
    },

    /// Transport could not place the message now
    #[error("Transport busy: {message}")]
    TransportBusy {
        /// What was contended
        message: String,
    },

    /// Poll found a message the caller's buffer cannot hold
    #[error("Message exceeds caller buffer ({needed} > {available} bytes)")]
    BufferTooSmall {
        /// Bytes the message needs
        needed: usize,
        /// Bytes the caller offered
        available: usize,
    },

    /// Malformed or illegal API call
    #[error("Invalid call: {message}")]
    InvalidCall {
        /// Error message describing the misuse
        message: String,
    },

    /// Event already satisfied (sticky double-satisfy is a caller bug)
    #[error("Event {guid:?} already satisfied")]
    EventAlreadySatisfied {
        /// The event that was satisfied twice
        guid: Guid,
    },

    /// Counted event received more subscribers than declared
    #[error("Counted event {guid:?} exceeded its declared {expected} subscribers")]
    SubscriberOverflow {
        /// The counted event
        guid: Guid,
        /// Declared subscriber population
        expected: u32,
    },

    /// Task was already dispatched and can no longer be destroyed
    #[error("Task {guid:?} already dispatched")]
    TaskAlreadyDispatched {
        /// The task the caller tried to destroy
        guid: Guid,
    },

    /// Serialization/deserialization errors
    #[error("Marshalling error: {message}")]
    Marshalling {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Marshalled payload failed its integrity check
    #[error("Message checksum mismatch (expected {expected:#010x}, found {found:#010x})")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum recomputed on receive
        found: u32,
    },

    /// Runlevel transition rejected
    #[error("Runlevel error: {message}")]
    Runlevel {
        /// Error message describing the transition problem
        message: String,
    },
}

impl WeftError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new unresolved-handle error
    pub fn unresolved(guid: Guid, message: impl Into<String>) -> Self {
        Self::UnresolvedGuid {
            guid,
            message: message.into(),
        }
    }

    /// Create a new invalid-call error
    pub fn invalid_call(message: impl Into<String>) -> Self {
        Self::InvalidCall {
            message: message.into(),
        }
    }

    /// Create a new transport-busy error
    pub fn busy(message: impl Into<String>) -> Self {
        Self::TransportBusy {
            message: message.into(),
        }
    }

    /// Create a new marshalling error
    pub fn marshalling(message: impl Into<String>) -> Self {
        Self::Marshalling {
            message: message.into(),
        }
    }

    /// Create a new runlevel error
    pub fn runlevel(message: impl Into<String>) -> Self {
        Self::Runlevel {
            message: message.into(),
        }
    }

    /// The short code this error propagates at the API boundary
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::QueueContended => ErrorCode::Eagain,
            Self::TransportBusy { .. } => ErrorCode::Ebusy,
            Self::QueueZeroCapacity => ErrorCode::Enomem,
            Self::SlotNotOwned { .. } => ErrorCode::Eperm,
            Self::BufferTooSmall { .. } => ErrorCode::Eintr,
            _ => ErrorCode::Einval,
        }
    }

    /// Check if this error is transient (caller should retry)
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Eagain | ErrorCode::Ebusy | ErrorCode::Eintr
        )
    }

    /// Check if this error is structural (escalates, aborts the runtime)
    pub fn is_structural(&self) -> bool {
        matches!(self.code(), ErrorCode::Enomem)
    }

    /// Check if this error indicates a caller bug
    pub fn is_caller_bug(&self) -> bool {
        matches!(self.code(), ErrorCode::Einval | ErrorCode::Eperm)
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::WeftError::config(format!($($arg)*))
    };
}

/// Convenience macro for creating invalid-call errors
#[macro_export]
macro_rules! invalid_call {
    ($($arg:tt)*) => {
        $crate::error::WeftError::invalid_call(format!($($arg)*))
    };
}
