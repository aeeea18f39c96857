//! Host capability surface.
//!
//! The host runtime (an interpreter, a scheduler, a test harness) owns the
//! waiting side of every operation. flownet reaches it only through this
//! trait, passed explicitly to `FlowNet::new`; there is no process-wide
//! runtime pointer.
//!
//! # Implementors
//!
//! - `CompletionQueue` (flownet-runtime): lock-free queue of fired indices
//!   with a blocking `wait_for`, used by tests and the `cmd/` tools.
//! - Language bindings: map an index to the host's semaphore table.

use crate::types::CompletionIndex;

/// Receives "operation finished" signals from worker threads.
///
/// **Contract:**
/// - `notify()` must NEVER block; it runs on poller and resolver threads.
/// - It may be called concurrently from many threads.
/// - The index is whatever the caller registered; flownet never interprets it.
pub trait Host: Send + Sync {
    /// Signal the completion channel `index`.
    fn notify(&self, index: CompletionIndex);
}

/// A host that drops every notification. Useful when the caller polls
/// outcomes itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl Host for NullHost {
    #[inline]
    fn notify(&self, _index: CompletionIndex) {}
}

impl<F> Host for F
where
    F: Fn(CompletionIndex) + Send + Sync,
{
    #[inline]
    fn notify(&self, index: CompletionIndex) {
        self(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_host() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        let host = move |idx: CompletionIndex| {
            seen2.store(idx.0, Ordering::SeqCst);
        };
        host.notify(CompletionIndex(9));
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_null_host_is_object_safe() {
        let host: Box<dyn Host> = Box::new(NullHost);
        host.notify(CompletionIndex(1));
    }
}
