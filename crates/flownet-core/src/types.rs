//! Handle, operation, outcome and state types shared by every component.
//!
//! The enums that poller threads publish through atomics carry explicit
//! `u8` discriminants and a `from_u8` decoder, the same way the scheduler
//! state types do.

use core::fmt;
use std::time::Duration;

/// Opaque handle to a socket or resolver.
///
/// The caller holds nothing else; all access goes through the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ResourceHandle(pub u64);

impl ResourceHandle {
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-assigned completion channel.
///
/// Opaque to flownet: a poller or resolver hands it to `Host::notify`
/// when its operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionIndex(pub u64);

impl CompletionIndex {
    /// Sentinel for "no channel registered".
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

/// Socket transport chosen at enable time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Transport {
    Tcp = 1,
    Udp = 2,
}

impl Transport {
    #[inline]
    pub fn from_is_tcp(is_tcp: bool) -> Self {
        if is_tcp {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }
}

/// One half of a socket; each half has its own poller thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    #[inline]
    pub const fn tag(self) -> &'static str {
        match self {
            Direction::Read => "rd",
            Direction::Write => "wr",
        }
    }
}

/// Operation a poller can be armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Connect = 1,
    Accept = 2,
    Read = 3,
    Write = 4,
}

impl Operation {
    /// Connect, accept and read are serviced by the read-side poller.
    #[inline]
    pub const fn direction(self) -> Direction {
        match self {
            Operation::Connect | Operation::Accept | Operation::Read => Direction::Read,
            Operation::Write => Direction::Write,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Operation::Connect),
            2 => Some(Operation::Accept),
            3 => Some(Operation::Read),
            4 => Some(Operation::Write),
            _ => None,
        }
    }
}

/// Classified result of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitOutcome {
    /// Deadline elapsed without readiness
    Timeout = 1,
    /// Descriptor is readable/writable
    Ready = 2,
    /// The wait primitive (or non-blocking setup) failed; the poller exited
    Error = 3,
    /// Non-blocking connect completed
    ConnectionSucceeded = 4,
    /// Non-blocking connect was refused or failed
    ConnectionFailed = 5,
}

impl WaitOutcome {
    /// Decode an atomic slot; 0 means "nothing published yet".
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WaitOutcome::Timeout),
            2 => Some(WaitOutcome::Ready),
            3 => Some(WaitOutcome::Error),
            4 => Some(WaitOutcome::ConnectionSucceeded),
            5 => Some(WaitOutcome::ConnectionFailed),
            _ => None,
        }
    }
}

/// Lifecycle state of a socket or resolver.
///
/// `Allocated` precedes `enable`. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceState {
    Allocated = 0,
    Open = 1,
    Listening = 2,
    Closed = 3,
}

impl ResourceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ResourceState::Allocated,
            1 => ResourceState::Open,
            2 => ResourceState::Listening,
            _ => ResourceState::Closed,
        }
    }

    #[inline]
    pub const fn is_closed(self) -> bool {
        matches!(self, ResourceState::Closed)
    }
}

/// How long a poller may wait for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until ready, interrupted or failed
    Never,
    /// Give up after this many milliseconds; zero means a single probe
    Millis(u64),
}

impl Timeout {
    /// Signed milliseconds as supplied by a host: negative values clamp to
    /// an immediate probe.
    pub fn from_millis(ms: i64) -> Self {
        Timeout::Millis(ms.max(0) as u64)
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Never => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

impl From<Option<u64>> for Timeout {
    fn from(ms: Option<u64>) -> Self {
        match ms {
            Some(ms) => Timeout::Millis(ms),
            None => Timeout::Never,
        }
    }
}

/// Result of the last lookup on a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolveOutcome {
    /// No lookup has completed yet
    Pending = 0,
    /// At least one IPv4 address was found
    Resolved = 1,
    /// Host not found or temporary failure; the resolver stays usable
    NotFound = 2,
}

impl ResolveOutcome {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ResolveOutcome::Resolved,
            2 => ResolveOutcome::NotFound,
            _ => ResolveOutcome::Pending,
        }
    }
}

/// What an inline connect attempt achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    /// The kernel completed the connect immediately
    Connected,
    /// Arm `Operation::Connect` and wait for the poller
    InProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_directions() {
        assert_eq!(Operation::Connect.direction(), Direction::Read);
        assert_eq!(Operation::Accept.direction(), Direction::Read);
        assert_eq!(Operation::Read.direction(), Direction::Read);
        assert_eq!(Operation::Write.direction(), Direction::Write);
    }

    #[test]
    fn test_outcome_decode() {
        assert_eq!(WaitOutcome::from_u8(0), None);
        for o in [
            WaitOutcome::Timeout,
            WaitOutcome::Ready,
            WaitOutcome::Error,
            WaitOutcome::ConnectionSucceeded,
            WaitOutcome::ConnectionFailed,
        ] {
            assert_eq!(WaitOutcome::from_u8(o as u8), Some(o));
        }
    }

    #[test]
    fn test_state_closed_absorbs_unknown() {
        assert_eq!(ResourceState::from_u8(0), ResourceState::Allocated);
        assert_eq!(ResourceState::from_u8(2), ResourceState::Listening);
        assert!(ResourceState::from_u8(200).is_closed());
    }

    #[test]
    fn test_timeout_clamps_negative() {
        assert_eq!(Timeout::from_millis(-5), Timeout::Millis(0));
        assert_eq!(Timeout::from_millis(250).as_duration(), Some(Duration::from_millis(250)));
        assert_eq!(Timeout::from(None).as_duration(), None);
    }

    #[test]
    fn test_completion_index_sentinel() {
        assert!(CompletionIndex::NONE.is_none());
        assert!(!CompletionIndex(3).is_none());
    }
}
