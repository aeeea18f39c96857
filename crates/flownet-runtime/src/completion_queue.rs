//! `CompletionQueue` - reference [`Host`] implementation.
//!
//! Poller and resolver threads push fired completion indices into a
//! lock-free bounded queue and signal a gate. The consuming thread drains
//! the queue or blocks for one particular index.
//!
//! Indices that arrive while the consumer waits for a different one are
//! parked and handed out later, so no notification is lost. Each
//! notification counts once, like a semaphore signal.

use flownet_core::{kwarn, CompletionIndex, Host};

use crate::config::NetConfig;
use crate::sync::Gate;

use crossbeam_queue::ArrayQueue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest single gate wait; bounds the time a missed wake could cost.
const MAX_PARK: Duration = Duration::from_millis(50);

pub struct CompletionQueue {
    fired: ArrayQueue<CompletionIndex>,
    overflowed: AtomicU64,
    gate: Gate,
    parked: Mutex<HashMap<CompletionIndex, usize>>,
}

impl CompletionQueue {
    /// `capacity`: notifications buffered before new ones are dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            fired: ArrayQueue::new(capacity.max(1)),
            overflowed: AtomicU64::new(0),
            gate: Gate::new(),
            parked: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &NetConfig) -> Self {
        Self::new(config.completion_capacity)
    }

    /// Take every pending notification, oldest first.
    pub fn drain(&self) -> Vec<CompletionIndex> {
        let mut out = Vec::new();
        {
            let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
            for (idx, n) in parked.drain() {
                out.extend(std::iter::repeat(idx).take(n));
            }
        }
        while let Some(idx) = self.fired.pop() {
            out.push(idx);
        }
        out
    }

    /// Consume one notification for `index` if one has fired. Never blocks.
    pub fn try_take(&self, index: CompletionIndex) -> bool {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(idx) = self.fired.pop() {
            *parked.entry(idx).or_insert(0) += 1;
        }
        match parked.get_mut(&index) {
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    parked.remove(&index);
                }
                true
            }
            None => false,
        }
    }

    /// Block until `index` fires or `timeout` elapses. True if it fired.
    pub fn wait_for(&self, index: CompletionIndex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_take(index) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.gate.wait_timeout((deadline - now).min(MAX_PARK));
        }
    }

    /// Block until any index fires; `None` on timeout.
    pub fn wait_any(&self, timeout: Duration) -> Option<CompletionIndex> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(idx) = self.take_any() {
                return Some(idx);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.gate.wait_timeout((deadline - now).min(MAX_PARK));
        }
    }

    /// Notifications dropped because the queue was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn take_any(&self) -> Option<CompletionIndex> {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        let key = parked.keys().next().copied();
        if let Some(idx) = key {
            if let Some(n) = parked.get_mut(&idx) {
                *n -= 1;
                if *n == 0 {
                    parked.remove(&idx);
                }
            }
            return Some(idx);
        }
        drop(parked);
        self.fired.pop()
    }
}

impl Host for CompletionQueue {
    fn notify(&self, index: CompletionIndex) {
        if self.fired.push(index).is_err() {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            kwarn!("completion queue full, dropped index {}", index.0);
        }
        self.gate.signal();
    }
}
