//! Error types for flownet operations

use core::fmt;

/// Result type for façade and lifecycle operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors reported synchronously to the caller.
///
/// Failures that happen on poller or resolver threads never show up here;
/// they are recorded as outcomes and read after the completion fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The handle table is at capacity
    AllocationFailed,

    /// A worker thread could not be spawned
    ResourceUnavailable,

    /// The handle was never allocated (or was discarded)
    UnknownHandle,

    /// Socket operation on a resolver handle, or the reverse
    WrongKind,

    /// The resource has not been enabled yet
    NotEnabled,

    /// `enable` called twice
    AlreadyEnabled,

    /// The resource is closed; no operation is valid
    ResourceClosed,

    /// `close` on a resource that is already closed
    AlreadyClosed,

    /// The resource state does not permit the operation
    /// (e.g. accept from a socket that is not listening)
    InvalidState,

    /// The direction already has an armed operation that has not completed
    OperationPending,

    /// The poller for this direction (or the resolver worker) has exited
    /// after an unrecoverable wait failure
    DirectionDead,

    /// A parameter is out of range or malformed
    InvalidArgument(&'static str),

    /// The operation is not supported for this transport
    Unsupported(&'static str),

    /// The platform broke a readiness guarantee
    InvariantViolation(&'static str),

    /// Name lookup failed (`EAI_*` code)
    LookupFailed(i32),

    /// OS error with errno
    Os(i32),
}

impl FlowError {
    /// True for errors caused by using a closed handle.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, FlowError::ResourceClosed | FlowError::AlreadyClosed)
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::AllocationFailed => write!(f, "resource allocation failed"),
            FlowError::ResourceUnavailable => write!(f, "worker thread unavailable"),
            FlowError::UnknownHandle => write!(f, "unknown handle"),
            FlowError::WrongKind => write!(f, "handle refers to a different kind of resource"),
            FlowError::NotEnabled => write!(f, "resource not enabled"),
            FlowError::AlreadyEnabled => write!(f, "resource already enabled"),
            FlowError::ResourceClosed => write!(f, "resource closed"),
            FlowError::AlreadyClosed => write!(f, "resource already closed"),
            FlowError::InvalidState => write!(f, "invalid resource state for operation"),
            FlowError::OperationPending => write!(f, "operation already pending on this direction"),
            FlowError::DirectionDead => write!(f, "worker thread has exited"),
            FlowError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            FlowError::Unsupported(what) => write!(f, "unsupported: {}", what),
            FlowError::InvariantViolation(what) => write!(f, "invariant violation: {}", what),
            FlowError::LookupFailed(code) => write!(f, "name lookup failed: code {}", code),
            FlowError::Os(errno) => write!(f, "OS error: errno {}", errno),
        }
    }
}

impl std::error::Error for FlowError {}
