//! # Readiness poller
//!
//! Every socket owns two pollers, one per [`Direction`], each on its own
//! OS thread. A poller:
//! 1. Parks on its `ThreadSync` until the caller arms an operation
//! 2. Blocks in `poll(2)` on the socket plus its interrupt descriptor
//! 3. Classifies the result into one [`WaitOutcome`]
//! 4. Publishes the outcome and notifies the direction's completion index
//!
//! A poller never moves data; the caller does that through the façade
//! once notified. A wait failure (`Error`) ends the poller for good
//! without notifying: the direction is dead until the socket is closed,
//! and the caller sees `DirectionDead` on its next arm.

use flownet_core::{
    kdebug, ktrace, kwarn, Direction, FlowError, FlowResult, Host, Operation, ResourceHandle,
    Timeout, WaitOutcome,
};

use crate::interrupt::Interrupt;
use crate::sync::{SyncPort, Wakeup};
use crate::sys;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// An armed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: Operation,
    pub timeout: Timeout,
}

/// State shared between the façade (arms, reads outcomes) and one poller
/// (takes requests, publishes outcomes).
#[derive(Debug, Default)]
pub struct DirectionState {
    request: Mutex<Option<Request>>,
    /// `WaitOutcome as u8`; 0 until the first publish after an arm
    outcome: AtomicU8,
    in_flight: AtomicBool,
    dead: AtomicBool,
}

impl DirectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request. Fails instead of overwriting one that has not
    /// completed yet.
    pub fn arm(&self, op: Operation, timeout: Timeout) -> FlowResult<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(FlowError::DirectionDead);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FlowError::OperationPending);
        }
        self.outcome.store(0, Ordering::Release);
        *self.request.lock().unwrap_or_else(PoisonError::into_inner) = Some(Request { op, timeout });
        Ok(())
    }

    fn take_request(&self) -> Option<Request> {
        self.request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn publish(&self, outcome: WaitOutcome) {
        self.outcome.store(outcome as u8, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    fn mark_dead(&self) {
        self.outcome.store(WaitOutcome::Error as u8, Ordering::Release);
        self.dead.store(true, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    /// Last published outcome; `None` while an operation is pending or
    /// before the first one.
    pub fn outcome(&self) -> Option<WaitOutcome> {
        WaitOutcome::from_u8(self.outcome.load(Ordering::Acquire))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Everything a poller thread needs. Holds no registry slot, so the owner
/// can tear the socket down independently.
pub struct PollerContext {
    pub handle: ResourceHandle,
    pub direction: Direction,
    pub fd: Arc<AtomicI32>,
    pub state: Arc<DirectionState>,
    pub interrupt: Arc<Interrupt>,
    pub host: Arc<dyn Host>,
}

enum Wait {
    Done(WaitOutcome),
    Interrupted,
}

/// Poller thread body.
pub fn run_poller(ctx: PollerContext, port: SyncPort) {
    let tag = ctx.direction.tag();
    kdebug!("poller {} {} started", ctx.handle, tag);

    loop {
        if port.wait() == Wakeup::Shutdown {
            break;
        }
        let Some(req) = ctx.state.take_request() else {
            continue;
        };

        let fd = ctx.fd.load(Ordering::Acquire);
        let outcome = match wait_readiness(fd, ctx.interrupt.fd(), req) {
            Wait::Interrupted => break,
            Wait::Done(outcome) => outcome,
        };
        if port.is_cancelled() {
            break;
        }

        ktrace!("poller {} {}: {:?} -> {:?}", ctx.handle, tag, req.op, outcome);
        if outcome == WaitOutcome::Error {
            ctx.state.mark_dead();
            kwarn!("poller {} {}: wait failed, direction is dead", ctx.handle, tag);
            break;
        }
        ctx.state.publish(outcome);
        port.notify(ctx.host.as_ref());
    }

    kdebug!("poller {} {} exited", ctx.handle, tag);
}

/// Block until `fd` is ready for `req.op`, the deadline passes, or the
/// interrupt fires. Waits at least the requested time before reporting
/// `Timeout`; a zero timeout is a single probe.
fn wait_readiness(fd: RawFd, interrupt_fd: RawFd, req: Request) -> Wait {
    if fd < 0 || sys::set_nonblocking(fd, true).is_err() {
        return Wait::Done(WaitOutcome::Error);
    }

    // Connect is serviced by the read-side poller but completes on
    // writability.
    let events = match req.op {
        Operation::Read | Operation::Accept => libc::POLLIN,
        Operation::Write | Operation::Connect => libc::POLLOUT,
    };
    let deadline = req.timeout.as_duration().map(|d| Instant::now() + d);

    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => remaining_ms(deadline),
        };
        let mut fds = [
            libc::pollfd { fd, events, revents: 0 },
            libc::pollfd { fd: interrupt_fd, events: libc::POLLIN, revents: 0 },
        ];

        match sys::poll(&mut fds, timeout_ms) {
            Err(e) if e == libc::EINTR => continue,
            Err(e) => {
                kwarn!("poll on fd {} failed: errno {}", fd, e);
                return Wait::Done(WaitOutcome::Error);
            }
            Ok(0) => {
                // poll may return early on coarse clocks; keep waiting
                // until the deadline has really passed.
                match deadline {
                    Some(deadline) if Instant::now() >= deadline => {
                        return Wait::Done(WaitOutcome::Timeout)
                    }
                    _ => continue,
                }
            }
            Ok(_) => {
                if fds[1].revents != 0 {
                    return Wait::Interrupted;
                }
                return Wait::Done(classify(fd, req.op, fds[0].revents));
            }
        }
    }
}

/// Milliseconds left until `deadline`, rounded up so the wait never ends
/// early.
fn remaining_ms(deadline: Instant) -> libc::c_int {
    let left = deadline.saturating_duration_since(Instant::now());
    let mut ms = left.as_millis();
    if left.as_nanos() > ms * 1_000_000 {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

fn classify(fd: RawFd, op: Operation, revents: libc::c_short) -> WaitOutcome {
    if revents & libc::POLLNVAL != 0 {
        return WaitOutcome::Error;
    }
    let exceptional = libc::POLLERR | libc::POLLHUP;

    match op {
        Operation::Read | Operation::Accept => {
            if revents & (libc::POLLIN | exceptional) != 0 {
                WaitOutcome::Ready
            } else {
                WaitOutcome::Error
            }
        }
        Operation::Write => {
            if revents & (libc::POLLOUT | exceptional) != 0 {
                WaitOutcome::Ready
            } else {
                WaitOutcome::Error
            }
        }
        Operation::Connect => {
            if revents & (libc::POLLIN | libc::POLLOUT | exceptional) == 0 {
                return WaitOutcome::Error;
            }
            match sys::socket_error(fd) {
                Ok(0) => WaitOutcome::ConnectionSucceeded,
                Ok(_) => WaitOutcome::ConnectionFailed,
                Err(_) => WaitOutcome::Error,
            }
        }
    }
}
