//! Socket resource: one descriptor, two pollers.
//!
//! The descriptor lives in an `Arc<AtomicI32>` shared with both pollers.
//! It is replaced by `accept` (only while neither direction is in flight)
//! and closed by `teardown` only after both pollers have been joined.

use flownet_core::{
    kdebug, kwarn, ConnectProgress, Direction, FlowError, FlowResult, Host, Operation,
    ResourceHandle, ResourceState, SocketAddress, Timeout, Transport, WaitOutcome,
    CompletionIndex,
};

use crate::config::NetConfig;
use crate::interrupt::Interrupt;
use crate::poller::{run_poller, DirectionState, PollerContext};
use crate::registry::LiveCount;
use crate::sync::ThreadSync;
use crate::sys;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

const NO_TRANSPORT: u8 = 0;

pub struct Socket {
    handle: ResourceHandle,
    fd: Arc<AtomicI32>,
    state: AtomicU8,
    transport: AtomicU8,
    reading: Arc<DirectionState>,
    writing: Arc<DirectionState>,
    reader: ThreadSync,
    writer: ThreadSync,
    live: LiveCount,
}

fn os(errno: i32) -> FlowError {
    FlowError::Os(errno)
}

/// Map a transfer failure. Would-block after a readiness signal means the
/// platform broke its promise; report it instead of retrying.
fn transfer_error(errno: i32, what: &'static str) -> FlowError {
    if sys::is_would_block(errno) {
        kwarn!("{} would block after readiness", what);
        FlowError::InvariantViolation(what)
    } else {
        FlowError::Os(errno)
    }
}

impl Socket {
    pub fn new(handle: ResourceHandle, live: LiveCount) -> Self {
        Self {
            handle,
            fd: Arc::new(AtomicI32::new(sys::NO_FD)),
            state: AtomicU8::new(ResourceState::Allocated as u8),
            transport: AtomicU8::new(NO_TRANSPORT),
            reading: Arc::new(DirectionState::new()),
            writing: Arc::new(DirectionState::new()),
            reader: ThreadSync::new(),
            writer: ThreadSync::new(),
            live,
        }
    }

    #[inline]
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn transport(&self) -> Option<Transport> {
        match self.transport.load(Ordering::Acquire) {
            1 => Some(Transport::Tcp),
            2 => Some(Transport::Udp),
            _ => None,
        }
    }

    #[inline]
    fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn direction(&self, direction: Direction) -> (&Arc<DirectionState>, &ThreadSync) {
        match direction {
            Direction::Read => (&self.reading, &self.reader),
            Direction::Write => (&self.writing, &self.writer),
        }
    }

    /// Open the descriptor and start both pollers.
    pub fn enable(
        &self,
        transport: Transport,
        host: &Arc<dyn Host>,
        config: &NetConfig,
    ) -> FlowResult<()> {
        match self.state() {
            ResourceState::Allocated => {}
            ResourceState::Closed => return Err(FlowError::ResourceClosed),
            _ => return Err(FlowError::AlreadyEnabled),
        }

        let fd = sys::open_socket(transport).map_err(os)?;
        if let Err(e) = sys::set_nonblocking(fd, true) {
            sys::close(fd);
            return Err(os(e));
        }
        self.fd.store(fd, Ordering::Release);
        self.transport.store(transport as u8, Ordering::Release);

        for direction in [Direction::Read, Direction::Write] {
            if let Err(e) = self.start_poller(direction, host, config) {
                self.teardown();
                return Err(e);
            }
        }

        self.state.store(ResourceState::Open as u8, Ordering::Release);
        kdebug!("socket {} enabled ({:?}, fd {})", self.handle, transport, fd);
        Ok(())
    }

    fn start_poller(
        &self,
        direction: Direction,
        host: &Arc<dyn Host>,
        config: &NetConfig,
    ) -> FlowResult<()> {
        let (state, sync) = self.direction(direction);
        let interrupt = Arc::new(Interrupt::create().map_err(|_| FlowError::ResourceUnavailable)?);
        let ctx = PollerContext {
            handle: self.handle,
            direction,
            fd: Arc::clone(&self.fd),
            state: Arc::clone(state),
            interrupt: Arc::clone(&interrupt),
            host: Arc::clone(host),
        };
        let name = format!("{}-{}-{}", config.thread_prefix, direction.tag(), self.handle.0);
        sync.start(name, config.poller_stack_size, Some(interrupt), move |port| {
            run_poller(ctx, port)
        })
    }

    pub fn register_channels(&self, read: CompletionIndex, write: CompletionIndex) {
        self.reader.set_completion(read);
        self.writer.set_completion(write);
    }

    /// Ok if the socket is open or listening.
    fn check_active(&self) -> FlowResult<ResourceState> {
        match self.state() {
            ResourceState::Allocated => Err(FlowError::NotEnabled),
            ResourceState::Closed => Err(FlowError::ResourceClosed),
            state => Ok(state),
        }
    }

    fn check_open(&self) -> FlowResult<()> {
        match self.check_active()? {
            ResourceState::Open => Ok(()),
            _ => Err(FlowError::InvalidState),
        }
    }

    fn is_tcp(&self) -> bool {
        self.transport() == Some(Transport::Tcp)
    }

    pub fn connect(&self, addr: SocketAddress) -> FlowResult<ConnectProgress> {
        self.check_open()?;
        if !self.is_tcp() {
            return Err(FlowError::Unsupported("connect on a UDP socket"));
        }
        let fd = self.fd();
        sys::set_nonblocking(fd, true).map_err(os)?;
        sys::connect(fd, addr).map_err(os)
    }

    /// Arm the poller that services `op` and wake it.
    pub fn arm(&self, op: Operation, timeout: Timeout) -> FlowResult<()> {
        self.check_active()?;
        let (state, sync) = self.direction(op.direction());
        state.arm(op, timeout)?;
        sync.signal();
        Ok(())
    }

    pub fn bind(&self, port: u16) -> FlowResult<()> {
        self.check_open()?;
        sys::bind(self.fd(), port).map_err(os)
    }

    /// Bind to `port` and start listening. Open -> Listening.
    pub fn listen(&self, port: u16, backlog: i32) -> FlowResult<()> {
        self.check_open()?;
        if !self.is_tcp() {
            return Err(FlowError::Unsupported("listen on a UDP socket"));
        }
        let fd = self.fd();
        sys::bind(fd, port).map_err(os)?;
        sys::listen(fd, backlog).map_err(os)?;
        self.state
            .compare_exchange(
                ResourceState::Open as u8,
                ResourceState::Listening as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| FlowError::ResourceClosed)?;
        Ok(())
    }

    /// Accept a pending connection from `server` into this socket,
    /// replacing (and closing) this socket's current descriptor.
    pub fn accept_from(&self, server: &Socket) -> FlowResult<()> {
        if server.check_active()? != ResourceState::Listening {
            return Err(FlowError::InvalidState);
        }
        self.check_open()?;
        if self.reading.is_in_flight() || self.writing.is_in_flight() {
            return Err(FlowError::OperationPending);
        }

        let fd = sys::accept(server.fd()).map_err(|e| transfer_error(e, "accept"))?;
        if let Err(e) = sys::set_nonblocking(fd, true) {
            sys::close(fd);
            return Err(os(e));
        }
        let old = self.fd.swap(fd, Ordering::AcqRel);
        sys::close(old);
        self.transport.store(Transport::Tcp as u8, Ordering::Release);
        kdebug!("socket {} accepted fd {} from {}", self.handle, fd, server.handle);
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> FlowResult<usize> {
        self.check_active()?;
        sys::recv(self.fd(), buf).map_err(|e| transfer_error(e, "recv"))
    }

    pub fn send(&self, buf: &[u8]) -> FlowResult<usize> {
        self.check_active()?;
        sys::send(self.fd(), buf).map_err(|e| transfer_error(e, "send"))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> FlowResult<(usize, SocketAddress)> {
        self.check_active()?;
        sys::recv_from(self.fd(), buf).map_err(|e| transfer_error(e, "recvfrom"))
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddress) -> FlowResult<usize> {
        self.check_active()?;
        sys::send_to(self.fd(), buf, addr).map_err(|e| transfer_error(e, "sendto"))
    }

    pub fn peer_address(&self) -> FlowResult<SocketAddress> {
        self.check_active()?;
        sys::peer_address(self.fd()).map_err(os)
    }

    pub fn local_port(&self) -> FlowResult<u16> {
        self.check_active()?;
        Ok(sys::local_address(self.fd()).map_err(os)?.port)
    }

    /// Peek for peer closure. A TCP socket whose peer closed or reset is
    /// torn down on the spot. UDP sockets are alive while open.
    pub fn is_alive(&self) -> bool {
        if self.check_active().is_err() {
            return false;
        }
        if self.is_tcp() && self.state() == ResourceState::Open && sys::peer_closed(self.fd()) {
            kdebug!("socket {} peer closed", self.handle);
            self.teardown();
            return false;
        }
        true
    }

    /// False for a dead socket, else whether a read would not block.
    pub fn has_data(&self) -> FlowResult<bool> {
        if !self.is_alive() {
            return Ok(false);
        }
        sys::readable_now(self.fd()).map_err(os)
    }

    pub fn outcome(&self, direction: Direction) -> Option<WaitOutcome> {
        self.direction(direction).0.outcome()
    }

    /// Mark closed, stop both pollers, close the descriptor. Returns false
    /// if the socket was already closed.
    pub fn teardown(&self) -> bool {
        let prev = self.state.swap(ResourceState::Closed as u8, Ordering::AcqRel);
        if ResourceState::from_u8(prev).is_closed() {
            return false;
        }
        self.reader.kill();
        self.writer.kill();
        let fd = self.fd.swap(sys::NO_FD, Ordering::AcqRel);
        sys::close(fd);
        self.live.release();
        kdebug!("socket {} closed", self.handle);
        true
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.teardown();
    }
}
