//! # ANVIL Error Handling
//!
//! Error types for the batch, submission and synchronization stack.
//!
//! Error handling in ANVIL follows these principles:
//! - Errors are typed and categorized by the component that raises them
//! - No panics in production code paths
//! - Device refusals carry a reason for debugging
//! - Nothing retries automatically; callers decide

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// ANVIL Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// ANVIL unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported by this device
    NotSupported,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of device or host memory
    OutOfMemory,
    /// Address not aligned
    MisalignedAddress,
    /// CPU mapping failed or access fell outside the mapping
    MappingFailed,
    /// No virtual address could be reserved or bound for an object
    AddressBindingFailed,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Batch buffer is full
    CapacityExceeded,
    /// Device refused a submission
    DeviceRejected(RejectReason),
    /// Bounded wait did not observe completion
    Timeout,

    // =========================================================================
    // Lifetime Errors
    // =========================================================================
    /// Handle used outside its valid lifetime
    InvalidHandleUse(HandleKind),
}

impl Error {
    /// Whether reissuing the same operation can succeed
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::AddressBindingFailed => write!(f, "address binding failed"),

            // Command
            Self::CapacityExceeded => write!(f, "batch capacity exceeded"),
            Self::DeviceRejected(reason) => write!(f, "device rejected submission: {}", reason),
            Self::Timeout => write!(f, "wait timed out"),

            // Lifetime
            Self::InvalidHandleUse(kind) => write!(f, "invalid use of {} handle", kind),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Why the device refused a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Command stream does not end with the end marker
    MissingEndMarker,
    /// Command stream could not be decoded
    MalformedStream,
    /// Target engine is not present on this device
    EngineUnavailable,
    /// Target context does not exist
    UnknownContext,
    /// A resource or fragment names an unknown object
    UnknownObject,
    /// A command references an address no object is bound at
    UnboundAddress,
    /// A pinned address collides with another binding
    AddressConflict,
    /// A fragment is empty or runs past its object
    FragmentOutOfBounds,
    /// Device could not place the objects of the submission
    OutOfMemory,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MissingEndMarker => "missing end marker",
            Self::MalformedStream => "malformed command stream",
            Self::EngineUnavailable => "engine unavailable",
            Self::UnknownContext => "unknown context",
            Self::UnknownObject => "unknown object",
            Self::UnboundAddress => "unbound address",
            Self::AddressConflict => "address conflict",
            Self::FragmentOutOfBounds => "fragment out of bounds",
            Self::OutOfMemory => "out of memory",
        };
        f.write_str(text)
    }
}

/// Kind of handle involved in an [`Error::InvalidHandleUse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Buffer object
    Buffer,
    /// Batch
    Batch,
    /// Execution context
    Context,
    /// Semaphore
    Semaphore,
    /// Fence
    Fence,
    /// CPU mapping
    Mapping,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Buffer => "buffer",
            Self::Batch => "batch",
            Self::Context => "context",
            Self::Semaphore => "semaphore",
            Self::Fence => "fence",
            Self::Mapping => "mapping",
        };
        f.write_str(text)
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        Error::DeviceRejected(reason)
    }
}

impl From<HandleKind> for Error {
    fn from(kind: HandleKind) -> Self {
        #[cfg(feature = "strict-handles")]
        debug_assert!(false, "invalid {} handle use", kind);
        Error::InvalidHandleUse(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_reason() {
        let err: Error = RejectReason::MissingEndMarker.into();
        assert_eq!(err.to_string(), "device rejected submission: missing end marker");

        let err: Error = HandleKind::Semaphore.into();
        assert_eq!(err.to_string(), "invalid use of semaphore handle");
    }

    #[test]
    fn test_only_timeouts_are_recoverable() {
        assert!(Error::Timeout.is_recoverable());
        assert!(!Error::CapacityExceeded.is_recoverable());
        assert!(!Error::DeviceRejected(RejectReason::MalformedStream).is_recoverable());
        assert!(!Error::AddressBindingFailed.is_recoverable());
    }
}
