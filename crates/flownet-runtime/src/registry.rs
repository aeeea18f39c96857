//! Handle table.
//!
//! Maps opaque [`ResourceHandle`]s to sockets and resolvers. Handles are
//! never reused. A released handle leaves a tombstone behind so that late
//! calls get `AlreadyClosed` / `ResourceClosed` rather than
//! `UnknownHandle`. Tombstones are only freed by `discard`.
//!
//! The live count is shared with every resource and dropped by whichever
//! path closes it first (explicit close, discard, or a socket's own
//! liveness teardown), so the allocation limit is checked without a scan.

use flownet_core::{FlowError, FlowResult, ResourceHandle};

use crate::resolver::Resolver;
use crate::socket::Socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

enum Slot {
    Socket(Arc<Socket>),
    Resolver(Arc<Resolver>),
    Closed,
}

impl Slot {
    /// Sockets torn down by a failed liveness check keep their slot until
    /// closed, but no longer count as live.
    fn is_live(&self) -> bool {
        match self {
            Slot::Socket(s) => !s.state().is_closed(),
            Slot::Resolver(r) => !r.state().is_closed(),
            Slot::Closed => false,
        }
    }
}

/// Number of resources allocated and not yet closed.
#[derive(Debug, Clone, Default)]
pub struct LiveCount(Arc<AtomicUsize>);

impl LiveCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Called once per resource, on its transition to closed.
    pub fn release(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A live resource removed by `discard`.
pub enum Retired {
    Socket(Arc<Socket>),
    Resolver(Arc<Resolver>),
}

pub struct Registry {
    slots: Mutex<HashMap<ResourceHandle, Slot>>,
    next: AtomicU64,
    live: LiveCount,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
            live: LiveCount::default(),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceHandle, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, make: impl FnOnce(ResourceHandle) -> Slot) -> FlowResult<ResourceHandle> {
        let mut slots = self.lock();
        if self.live.get() >= self.capacity {
            return Err(FlowError::AllocationFailed);
        }
        let handle = ResourceHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.live.acquire();
        slots.insert(handle, make(handle));
        Ok(handle)
    }

    pub fn allocate_socket(&self) -> FlowResult<ResourceHandle> {
        self.insert(|h| Slot::Socket(Arc::new(Socket::new(h, self.live.clone()))))
    }

    pub fn allocate_resolver(&self) -> FlowResult<ResourceHandle> {
        self.insert(|h| Slot::Resolver(Arc::new(Resolver::new(h, self.live.clone()))))
    }

    pub fn socket(&self, handle: ResourceHandle) -> FlowResult<Arc<Socket>> {
        match self.lock().get(&handle) {
            Some(Slot::Socket(s)) => Ok(Arc::clone(s)),
            Some(Slot::Resolver(_)) => Err(FlowError::WrongKind),
            Some(Slot::Closed) => Err(FlowError::ResourceClosed),
            None => Err(FlowError::UnknownHandle),
        }
    }

    pub fn resolver(&self, handle: ResourceHandle) -> FlowResult<Arc<Resolver>> {
        match self.lock().get(&handle) {
            Some(Slot::Resolver(r)) => Ok(Arc::clone(r)),
            Some(Slot::Socket(_)) => Err(FlowError::WrongKind),
            Some(Slot::Closed) => Err(FlowError::ResourceClosed),
            None => Err(FlowError::UnknownHandle),
        }
    }

    /// True if `handle` is a tombstone.
    pub fn is_tombstone(&self, handle: ResourceHandle) -> bool {
        matches!(self.lock().get(&handle), Some(Slot::Closed))
    }

    /// Replace a live socket entry with a tombstone and hand the socket
    /// back for teardown outside the lock.
    pub fn retire_socket(&self, handle: ResourceHandle) -> FlowResult<Arc<Socket>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&handle).ok_or(FlowError::UnknownHandle)?;
        let socket = match slot {
            Slot::Socket(s) => Arc::clone(s),
            Slot::Resolver(_) => return Err(FlowError::WrongKind),
            Slot::Closed => return Err(FlowError::AlreadyClosed),
        };
        *slot = Slot::Closed;
        Ok(socket)
    }

    pub fn retire_resolver(&self, handle: ResourceHandle) -> FlowResult<Arc<Resolver>> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&handle).ok_or(FlowError::UnknownHandle)?;
        let resolver = match slot {
            Slot::Resolver(r) => Arc::clone(r),
            Slot::Socket(_) => return Err(FlowError::WrongKind),
            Slot::Closed => return Err(FlowError::AlreadyClosed),
        };
        *slot = Slot::Closed;
        Ok(resolver)
    }

    /// Forget `handle` entirely. A live resource is handed back for
    /// teardown first.
    pub fn discard(&self, handle: ResourceHandle) -> FlowResult<Option<Retired>> {
        match self.lock().remove(&handle) {
            Some(Slot::Socket(s)) => Ok(Some(Retired::Socket(s))),
            Some(Slot::Resolver(r)) => Ok(Some(Retired::Resolver(r))),
            Some(Slot::Closed) => Ok(None),
            None => Err(FlowError::UnknownHandle),
        }
    }

    /// Handles of every live resource, in allocation order.
    pub fn live_handles(&self) -> Vec<ResourceHandle> {
        let mut handles: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(h, _)| *h)
            .collect();
        handles.sort();
        handles
    }

    pub fn live_count(&self) -> usize {
        self.live.get()
    }
}
