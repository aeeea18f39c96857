//! Resolver resource: one worker thread doing blocking forward lookups.
//!
//! `getaddrinfo` has no cancellation hook. Close therefore joins the worker
//! only when it is idle; a worker inside a lookup is detached and exits on
//! its own when the call returns, without touching the host.
//!
//! Idle vs busy is decided with a store-then-load handshake on two SeqCst
//! atomics: the closer stores `Closed` then loads `busy`; the worker stores
//! `busy` then loads the state. At least one side sees the other's store.

use flownet_core::{
    kdebug, ktrace, kwarn, CompletionIndex, FlowError, FlowResult, Host, ResolveOutcome,
    ResourceHandle, ResourceState,
};

use crate::config::NetConfig;
use crate::registry::LiveCount;
use crate::sync::{SyncPort, ThreadSync, Wakeup};
use crate::sys;

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

struct ResolverShared {
    handle: ResourceHandle,
    state: AtomicU8,
    hostname: Mutex<Option<CString>>,
    /// IPv4 address bytes in native-endian `u32` form
    address: AtomicU32,
    outcome: AtomicU8,
    busy: AtomicBool,
    in_flight: AtomicBool,
    dead: AtomicBool,
}

impl ResolverShared {
    fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Forward lookup: `Ok(None)` when the name has no IPv4 address, `Err`
/// with the `EAI_*` code otherwise.
pub type Lookup = fn(&CStr) -> Result<Option<[u8; 4]>, i32>;

pub struct Resolver {
    shared: Arc<ResolverShared>,
    sync: ThreadSync,
    lookup: Lookup,
    live: LiveCount,
}

impl Resolver {
    pub fn new(handle: ResourceHandle, live: LiveCount) -> Self {
        Self {
            shared: Arc::new(ResolverShared {
                handle,
                state: AtomicU8::new(ResourceState::Allocated as u8),
                hostname: Mutex::new(None),
                address: AtomicU32::new(0),
                outcome: AtomicU8::new(ResolveOutcome::Pending as u8),
                busy: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                dead: AtomicBool::new(false),
            }),
            sync: ThreadSync::new(),
            lookup: sys::resolve_ipv4,
            live,
        }
    }

    #[cfg(test)]
    fn with_lookup(mut self, lookup: Lookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn handle(&self) -> ResourceHandle {
        self.shared.handle
    }

    pub fn state(&self) -> ResourceState {
        self.shared.state()
    }

    /// Start the worker thread.
    pub fn enable(&self, host: &Arc<dyn Host>, config: &NetConfig) -> FlowResult<()> {
        match self.state() {
            ResourceState::Allocated => {}
            ResourceState::Closed => return Err(FlowError::ResourceClosed),
            _ => return Err(FlowError::AlreadyEnabled),
        }

        let shared = Arc::clone(&self.shared);
        let host = Arc::clone(host);
        let lookup = self.lookup;
        let name = format!("{}-dns-{}", config.thread_prefix, self.shared.handle.0);
        self.sync
            .start(name, config.resolver_stack_size, None, move |port| {
                run_resolver(shared, host, port, lookup)
            })?;

        self.shared
            .state
            .store(ResourceState::Open as u8, Ordering::SeqCst);
        kdebug!("resolver {} enabled", self.shared.handle);
        Ok(())
    }

    pub fn register_channel(&self, index: CompletionIndex) {
        self.sync.set_completion(index);
    }

    fn check_open(&self) -> FlowResult<()> {
        match self.state() {
            ResourceState::Allocated => Err(FlowError::NotEnabled),
            ResourceState::Closed => Err(FlowError::ResourceClosed),
            _ => Ok(()),
        }
    }

    /// Submit `hostname` for lookup. Completion is signaled on the
    /// registered channel.
    pub fn resolve(&self, hostname: &str) -> FlowResult<()> {
        self.check_open()?;
        if self.shared.dead.load(Ordering::Acquire) {
            return Err(FlowError::DirectionDead);
        }
        let name =
            CString::new(hostname).map_err(|_| FlowError::InvalidArgument("hostname contains NUL"))?;
        if self
            .shared
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlowError::OperationPending);
        }

        *self
            .shared
            .hostname
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(name);
        self.shared
            .outcome
            .store(ResolveOutcome::Pending as u8, Ordering::Release);
        self.sync.signal();
        Ok(())
    }

    pub fn outcome(&self) -> FlowResult<ResolveOutcome> {
        self.check_open()?;
        Ok(ResolveOutcome::from_u8(self.shared.outcome.load(Ordering::Acquire)))
    }

    /// Address from the last successful lookup; `None` otherwise.
    pub fn address(&self) -> FlowResult<Option<[u8; 4]>> {
        match self.outcome()? {
            ResolveOutcome::Resolved => {
                Ok(Some(self.shared.address.load(Ordering::Acquire).to_ne_bytes()))
            }
            _ => Ok(None),
        }
    }

    /// Mark closed and retire the worker. Returns false if already closed.
    pub fn close(&self) -> bool {
        let prev = self
            .shared
            .state
            .swap(ResourceState::Closed as u8, Ordering::SeqCst);
        if ResourceState::from_u8(prev).is_closed() {
            return false;
        }
        if self.shared.busy.load(Ordering::SeqCst) {
            self.sync.kill();
        } else {
            self.sync.stop();
        }
        self.live.release();
        kdebug!("resolver {} closed", self.shared.handle);
        true
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_resolver(shared: Arc<ResolverShared>, host: Arc<dyn Host>, port: SyncPort, lookup: Lookup) {
    kdebug!("resolver {} started", shared.handle);

    loop {
        if port.wait() == Wakeup::Shutdown {
            break;
        }

        shared.busy.store(true, Ordering::SeqCst);
        if shared.state().is_closed() {
            shared.busy.store(false, Ordering::SeqCst);
            break;
        }
        let name = shared
            .hostname
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(name) = name else {
            shared.busy.store(false, Ordering::SeqCst);
            continue;
        };

        let result = lookup(&name);
        shared.busy.store(false, Ordering::SeqCst);
        if shared.state().is_closed() || port.is_cancelled() {
            break;
        }

        let outcome = match result {
            Ok(Some(ip)) => {
                shared.address.store(u32::from_ne_bytes(ip), Ordering::Release);
                ResolveOutcome::Resolved
            }
            Ok(None) => ResolveOutcome::NotFound,
            Err(code) if sys::is_fatal_lookup(code) => {
                kwarn!(
                    "resolver {}: lookup subsystem failed (code {}), worker exiting",
                    shared.handle,
                    code
                );
                shared.dead.store(true, Ordering::Release);
                shared.in_flight.store(false, Ordering::Release);
                break;
            }
            Err(code) => {
                ktrace!("resolver {}: {:?} not found (code {})", shared.handle, name, code);
                ResolveOutcome::NotFound
            }
        };
        if outcome == ResolveOutcome::NotFound {
            shared.address.store(0, Ordering::Release);
        }

        shared.outcome.store(outcome as u8, Ordering::Release);
        shared.in_flight.store(false, Ordering::Release);
        port.notify(host.as_ref());
    }

    kdebug!("resolver {} exited", shared.handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_queue::CompletionQueue;
    use std::time::{Duration, Instant};

    fn enabled(id: u64) -> (Resolver, Arc<CompletionQueue>) {
        let queue = Arc::new(CompletionQueue::new(16));
        let host: Arc<dyn Host> = queue.clone();
        let r = Resolver::new(ResourceHandle(id), LiveCount::default());
        r.enable(&host, &NetConfig::default()).unwrap();
        r.register_channel(CompletionIndex(id));
        (r, queue)
    }

    #[test]
    fn test_resolve_localhost() {
        let (r, queue) = enabled(1);
        r.resolve("localhost").unwrap();
        assert!(queue.wait_for(CompletionIndex(1), Duration::from_secs(5)));
        assert_eq!(r.outcome(), Ok(ResolveOutcome::Resolved));
        assert_eq!(r.address(), Ok(Some([127, 0, 0, 1])));
        assert!(r.close());
    }

    #[test]
    fn test_unknown_host_is_recoverable() {
        let (r, queue) = enabled(2);
        r.resolve("no-such-host.invalid").unwrap();
        assert!(queue.wait_for(CompletionIndex(2), Duration::from_secs(10)));
        assert_eq!(r.outcome(), Ok(ResolveOutcome::NotFound));
        assert_eq!(r.address(), Ok(None));

        r.resolve("localhost").unwrap();
        assert!(queue.wait_for(CompletionIndex(2), Duration::from_secs(5)));
        assert_eq!(r.address(), Ok(Some([127, 0, 0, 1])));
    }

    #[test]
    fn test_resolve_rejects_nul() {
        let (r, _queue) = enabled(3);
        assert!(matches!(
            r.resolve("bad\0name"),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_close_twice() {
        let (r, _queue) = enabled(4);
        assert!(r.close());
        assert!(!r.close());
        assert_eq!(r.resolve("localhost"), Err(FlowError::ResourceClosed));
    }

    #[test]
    fn test_resolve_before_enable() {
        let r = Resolver::new(ResourceHandle(5), LiveCount::default());
        assert_eq!(r.resolve("localhost"), Err(FlowError::NotEnabled));
    }

    fn broken_lookup(_: &CStr) -> Result<Option<[u8; 4]>, i32> {
        Err(libc::EAI_FAIL)
    }

    fn missing_lookup(_: &CStr) -> Result<Option<[u8; 4]>, i32> {
        Err(libc::EAI_NONAME)
    }

    #[test]
    fn test_fatal_lookup_exits_without_notify() {
        let queue = Arc::new(CompletionQueue::new(16));
        let host: Arc<dyn Host> = queue.clone();
        let r = Resolver::new(ResourceHandle(6), LiveCount::default()).with_lookup(broken_lookup);
        r.enable(&host, &NetConfig::default()).unwrap();
        r.register_channel(CompletionIndex(6));

        r.resolve("localhost").unwrap();
        assert!(!queue.wait_for(CompletionIndex(6), Duration::from_millis(200)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while r.sync.is_running() {
            assert!(Instant::now() < deadline, "resolver worker did not exit");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(r.resolve("localhost"), Err(FlowError::DirectionDead));
        assert_eq!(r.outcome(), Ok(ResolveOutcome::Pending));
        assert_eq!(r.address(), Ok(None));
        assert!(r.close());
    }

    #[test]
    fn test_missing_name_keeps_worker() {
        let queue = Arc::new(CompletionQueue::new(16));
        let host: Arc<dyn Host> = queue.clone();
        let r = Resolver::new(ResourceHandle(7), LiveCount::default()).with_lookup(missing_lookup);
        r.enable(&host, &NetConfig::default()).unwrap();
        r.register_channel(CompletionIndex(7));

        for _ in 0..2 {
            r.resolve("nowhere").unwrap();
            assert!(queue.wait_for(CompletionIndex(7), Duration::from_secs(2)));
            assert_eq!(r.outcome(), Ok(ResolveOutcome::NotFound));
        }
        assert!(r.sync.is_running());
    }
}
