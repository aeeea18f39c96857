//! ThreadSync: single-slot wake/wait handoff between the caller and one
//! worker thread.
//!
//! The gate is a `Mutex<GateState>` + `Condvar`. A signal sets a pending
//! latch; `wait` consumes it. Signals fired before the worker waits are
//! not lost, and several of them collapse into one wake.
//!
//! Shutdown is cooperative: `stop`/`kill` set a cancelled flag that every
//! `wait` reports as [`Wakeup::Shutdown`]. A worker blocked somewhere else
//! is kicked through its [`Interrupt`] (pollers) or, if it has none
//! (resolver stuck in `getaddrinfo`), detached and left to exit on its own.

use flownet_core::{kdebug, kwarn, CompletionIndex, FlowError, FlowResult, Host};

use crate::interrupt::Interrupt;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Why `wait` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A signal was pending and has been consumed
    Signaled,
    /// The sync was stopped or killed; the worker must exit
    Shutdown,
}

#[derive(Debug, Default)]
struct GateState {
    pending: bool,
    cancelled: bool,
}

/// Coalescing wake/wait gate.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a signal pending and wake the waiter. Never blocks for longer
    /// than the gate's own critical section.
    pub fn signal(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending = true;
        }
        self.cond.notify_one();
    }

    /// Block until a signal is pending (or the gate is cancelled).
    pub fn wait(&self) -> Wakeup {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.cancelled {
                return Wakeup::Shutdown;
            }
            if state.pending {
                state.pending = false;
                return Wakeup::Signaled;
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Wakeup> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.cancelled && !state.pending {
            let (guard, _) = self
                .cond
                .wait_timeout_while(state, timeout, |s| !s.cancelled && !s.pending)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        if state.cancelled {
            Some(Wakeup::Shutdown)
        } else if state.pending {
            state.pending = false;
            Some(Wakeup::Signaled)
        } else {
            None
        }
    }

    /// Latch the gate into shutdown and wake every waiter.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.cancelled = true;
        }
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancelled
    }
}

struct SyncShared {
    gate: Gate,
    completion: AtomicU64,
}

/// Worker-side view of a [`ThreadSync`].
#[derive(Clone)]
pub struct SyncPort {
    shared: Arc<SyncShared>,
}

impl SyncPort {
    #[inline]
    pub fn wait(&self) -> Wakeup {
        self.shared.gate.wait()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.gate.is_cancelled()
    }

    /// Signal the registered completion index, if any.
    pub fn notify(&self, host: &dyn Host) {
        let index = CompletionIndex(self.shared.completion.load(Ordering::Acquire));
        if !index.is_none() {
            host.notify(index);
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    interrupt: Option<Arc<Interrupt>>,
}

/// Owner-side handle: the gate, the completion index, and the worker thread.
pub struct ThreadSync {
    shared: Arc<SyncShared>,
    worker: Mutex<Option<Worker>>,
}

impl ThreadSync {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SyncShared {
                gate: Gate::new(),
                completion: AtomicU64::new(CompletionIndex::NONE.0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn port(&self) -> SyncPort {
        SyncPort {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the worker. `interrupt`, when given, is fired by `kill` and
    /// makes `kill` join instead of detaching.
    pub fn start<F>(
        &self,
        name: String,
        stack_size: usize,
        interrupt: Option<Arc<Interrupt>>,
        body: F,
    ) -> FlowResult<()>
    where
        F: FnOnce(SyncPort) + Send + 'static,
    {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(FlowError::AlreadyEnabled);
        }

        let port = self.port();
        let handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || body(port))
            .map_err(|e| {
                kwarn!("failed to spawn {}: {}", name, e);
                FlowError::ResourceUnavailable
            })?;

        *worker = Some(Worker { handle, interrupt });
        Ok(())
    }

    #[inline]
    pub fn signal(&self) {
        self.shared.gate.signal();
    }

    pub fn set_completion(&self, index: CompletionIndex) {
        self.shared.completion.store(index.0, Ordering::Release);
    }

    /// Cooperative shutdown: wake the worker with `Shutdown` and join it.
    /// Blocks until the worker's current step finishes.
    pub fn stop(&self) {
        let worker = self.take_worker();
        self.shared.gate.cancel();
        if let Some(w) = worker {
            join(w.handle);
        }
    }

    /// Forced shutdown. Fires the interrupt and joins when one is attached;
    /// otherwise the thread is detached and exits when its blocking call
    /// returns. Idempotent.
    pub fn kill(&self) {
        let worker = self.take_worker();
        self.shared.gate.cancel();
        let Some(w) = worker else { return };

        match w.interrupt {
            Some(interrupt) => {
                interrupt.fire();
                join(w.handle);
            }
            None => {
                kdebug!(
                    "detaching {}",
                    w.handle.thread().name().unwrap_or("worker")
                );
                drop(w.handle);
            }
        }
    }

    /// True while a started worker has not finished.
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished())
    }

    fn take_worker(&self) -> Option<Worker> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Default for ThreadSync {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadSync {
    fn drop(&mut self) {
        self.kill();
    }
}

fn join(handle: JoinHandle<()>) {
    // A worker never joins itself; that would deadlock.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        kwarn!("worker thread panicked");
    }
}
