//! # FlowNet façade
//!
//! The operation surface a host binding calls. Every method is
//! synchronous and non-blocking except `reverse_lookup`, and returns a
//! `FlowResult`; long waits are delegated to pollers and the resolver
//! worker, which report back through the [`Host`] given at construction.
//!
//! Typical read on a socket:
//! ```ignore
//! net.arm(sock, Operation::Read, Timeout::Millis(500))?;
//! // ... host waits for the socket's read channel ...
//! if net.is_timed_out(sock)? { /* retry or give up */ }
//! let n = net.recv(sock, &mut buf, buf.len())?;
//! ```

use flownet_core::{
    kdebug, CompletionIndex, ConnectProgress, Direction, FlowError, FlowResult, Host, Operation,
    PeerInfo, ResolveOutcome, ResourceHandle, ResourceState, SocketAddress, Timeout, Transport,
    WaitOutcome,
};

use crate::config::NetConfig;
use crate::registry::{Registry, Retired};
use crate::socket::Socket;
use crate::sys;

use std::sync::Arc;

pub struct FlowNet {
    host: Arc<dyn Host>,
    config: NetConfig,
    registry: Registry,
}

impl FlowNet {
    /// Create with configuration from the environment.
    pub fn new(host: Arc<dyn Host>) -> FlowResult<Self> {
        Self::with_config(host, NetConfig::from_env())
    }

    pub fn with_config(host: Arc<dyn Host>, config: NetConfig) -> FlowResult<Self> {
        config.validate().map_err(FlowError::InvalidArgument)?;
        let registry = Registry::new(config.max_resources);
        Ok(Self {
            host,
            config,
            registry,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    // ── Resolver ──

    pub fn new_resolver(&self) -> FlowResult<ResourceHandle> {
        self.registry.allocate_resolver()
    }

    pub fn enable_resolver(&self, handle: ResourceHandle) -> FlowResult<()> {
        self.registry
            .resolver(handle)?
            .enable(&self.host, &self.config)
    }

    pub fn register_resolution_channel(
        &self,
        handle: ResourceHandle,
        index: CompletionIndex,
    ) -> FlowResult<()> {
        let resolver = self.registry.resolver(handle)?;
        if resolver.state().is_closed() {
            return Err(FlowError::ResourceClosed);
        }
        resolver.register_channel(index);
        Ok(())
    }

    /// Start a lookup; the resolution channel fires when it finishes.
    pub fn resolve(&self, handle: ResourceHandle, hostname: &str) -> FlowResult<()> {
        self.registry.resolver(handle)?.resolve(hostname)
    }

    /// The 4 address bytes of the last successful lookup.
    pub fn resolved_address(&self, handle: ResourceHandle) -> FlowResult<Option<[u8; 4]>> {
        self.registry.resolver(handle)?.address()
    }

    pub fn resolution_outcome(&self, handle: ResourceHandle) -> FlowResult<ResolveOutcome> {
        self.registry.resolver(handle)?.outcome()
    }

    /// Host name for an IPv4 address. Blocks in the system resolver.
    pub fn reverse_lookup(&self, ip: [u8; 4]) -> FlowResult<String> {
        sys::name_for_address(ip).map_err(FlowError::LookupFailed)
    }

    pub fn close_resolver(&self, handle: ResourceHandle) -> FlowResult<()> {
        let resolver = self.registry.retire_resolver(handle)?;
        resolver.close();
        Ok(())
    }

    // ── Sockets ──

    pub fn new_socket(&self) -> FlowResult<ResourceHandle> {
        self.registry.allocate_socket()
    }

    /// Open the descriptor and start the read and write pollers.
    pub fn enable_socket(&self, handle: ResourceHandle, transport: Transport) -> FlowResult<()> {
        self.registry
            .socket(handle)?
            .enable(transport, &self.host, &self.config)
    }

    /// Completion indices for the read-side (connect, accept, read) and
    /// write-side pollers.
    pub fn register_socket_channels(
        &self,
        handle: ResourceHandle,
        read: CompletionIndex,
        write: CompletionIndex,
    ) -> FlowResult<()> {
        let socket = self.registry.socket(handle)?;
        if socket.state().is_closed() {
            return Err(FlowError::ResourceClosed);
        }
        socket.register_channels(read, write);
        Ok(())
    }

    /// Start a TCP connect. On `InProgress`, arm `Operation::Connect`.
    pub fn connect(
        &self,
        handle: ResourceHandle,
        address: SocketAddress,
    ) -> FlowResult<ConnectProgress> {
        self.registry.socket(handle)?.connect(address)
    }

    /// Arm the poller for `op`. Only one operation per direction may be
    /// outstanding.
    pub fn arm(&self, handle: ResourceHandle, op: Operation, timeout: Timeout) -> FlowResult<()> {
        self.registry.socket(handle)?.arm(op, timeout)
    }

    pub fn bind(&self, handle: ResourceHandle, port: u16) -> FlowResult<()> {
        self.registry.socket(handle)?.bind(port)
    }

    pub fn listen(&self, handle: ResourceHandle, port: u16, backlog: i32) -> FlowResult<()> {
        self.registry.socket(handle)?.listen(port, backlog)
    }

    /// Accept a pending connection on `server` into `client`.
    pub fn accept(&self, client: ResourceHandle, server: ResourceHandle) -> FlowResult<()> {
        let server = self.registry.socket(server)?;
        self.registry.socket(client)?.accept_from(&server)
    }

    /// True if the socket has been found closed, or if the last read-side
    /// wait timed out.
    pub fn is_timed_out(&self, handle: ResourceHandle) -> FlowResult<bool> {
        let Some(socket) = self.live_or_tombstone(handle)? else {
            return Ok(true);
        };
        if !socket.is_alive() {
            return Ok(true);
        }
        Ok(socket.outcome(Direction::Read) == Some(WaitOutcome::Timeout))
    }

    pub fn is_connection_refused(&self, handle: ResourceHandle) -> FlowResult<bool> {
        let socket = self.registry.socket(handle)?;
        Ok(socket.outcome(Direction::Read) == Some(WaitOutcome::ConnectionFailed))
    }

    /// Remote address, plus its host name when reverse lookup finds one.
    pub fn peer(&self, handle: ResourceHandle) -> FlowResult<PeerInfo> {
        let address = self.registry.socket(handle)?.peer_address()?;
        let name = sys::name_for_address(address.ip).ok();
        Ok(PeerInfo { address, name })
    }

    pub fn has_data(&self, handle: ResourceHandle) -> FlowResult<bool> {
        match self.live_or_tombstone(handle)? {
            Some(socket) => socket.has_data(),
            None => Ok(false),
        }
    }

    /// Read up to `count` bytes into the front of `buf`.
    pub fn recv(&self, handle: ResourceHandle, buf: &mut [u8], count: usize) -> FlowResult<usize> {
        let target = buf
            .get_mut(..count)
            .ok_or(FlowError::InvalidArgument("count exceeds buffer"))?;
        self.registry.socket(handle)?.recv(target)
    }

    /// Send `buf[offset..offset + count]`.
    pub fn send(
        &self,
        handle: ResourceHandle,
        buf: &[u8],
        offset: usize,
        count: usize,
    ) -> FlowResult<usize> {
        let end = offset
            .checked_add(count)
            .ok_or(FlowError::InvalidArgument("offset + count overflows"))?;
        let source = buf
            .get(offset..end)
            .ok_or(FlowError::InvalidArgument("range exceeds buffer"))?;
        self.registry.socket(handle)?.send(source)
    }

    /// Peek for peer closure; a closed TCP peer tears the socket down.
    pub fn is_alive(&self, handle: ResourceHandle) -> FlowResult<bool> {
        match self.live_or_tombstone(handle)? {
            Some(socket) => {
                if socket.state() == ResourceState::Allocated {
                    return Err(FlowError::NotEnabled);
                }
                Ok(socket.is_alive())
            }
            None => Ok(false),
        }
    }

    pub fn recv_from(
        &self,
        handle: ResourceHandle,
        buf: &mut [u8],
    ) -> FlowResult<(usize, SocketAddress)> {
        self.registry.socket(handle)?.recv_from(buf)
    }

    pub fn send_to(
        &self,
        handle: ResourceHandle,
        buf: &[u8],
        address: SocketAddress,
    ) -> FlowResult<usize> {
        self.registry.socket(handle)?.send_to(buf, address)
    }

    /// Raw last outcome of one direction's poller; `None` while pending.
    pub fn last_outcome(
        &self,
        handle: ResourceHandle,
        direction: Direction,
    ) -> FlowResult<Option<WaitOutcome>> {
        Ok(self.registry.socket(handle)?.outcome(direction))
    }

    pub fn local_port(&self, handle: ResourceHandle) -> FlowResult<u16> {
        self.registry.socket(handle)?.local_port()
    }

    /// Release the socket: stop both pollers, close the descriptor. The
    /// handle becomes a tombstone, which stays in the table until
    /// [`discard`](Self::discard) is called for it.
    pub fn close(&self, handle: ResourceHandle) -> FlowResult<()> {
        let socket = self.registry.retire_socket(handle)?;
        socket.teardown();
        Ok(())
    }

    // ── Handles ──

    /// Forget a handle. A live resource is released first.
    pub fn discard(&self, handle: ResourceHandle) -> FlowResult<()> {
        match self.registry.discard(handle)? {
            Some(Retired::Socket(s)) => {
                s.teardown();
            }
            Some(Retired::Resolver(r)) => {
                r.close();
            }
            None => {}
        }
        Ok(())
    }

    /// Number of resources not yet closed.
    pub fn live_resources(&self) -> usize {
        self.registry.live_count()
    }

    /// `Ok(None)` for a closed socket's tombstone.
    fn live_or_tombstone(&self, handle: ResourceHandle) -> FlowResult<Option<Arc<Socket>>> {
        match self.registry.socket(handle) {
            Ok(socket) => Ok(Some(socket)),
            Err(FlowError::ResourceClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FlowNet {
    fn drop(&mut self) {
        let live = self.registry.live_handles();
        if !live.is_empty() {
            kdebug!("releasing {} live resources", live.len());
        }
        for handle in live {
            let _ = self.discard(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_queue::CompletionQueue;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn rig() -> (FlowNet, Arc<CompletionQueue>) {
        let queue = Arc::new(CompletionQueue::new(256));
        let host: Arc<dyn Host> = queue.clone();
        let net = FlowNet::with_config(host, NetConfig::default()).unwrap();
        (net, queue)
    }

    fn read_channel(h: ResourceHandle) -> CompletionIndex {
        CompletionIndex(h.0 * 2)
    }

    fn write_channel(h: ResourceHandle) -> CompletionIndex {
        CompletionIndex(h.0 * 2 + 1)
    }

    fn socket(net: &FlowNet, transport: Transport) -> ResourceHandle {
        let h = net.new_socket().unwrap();
        net.enable_socket(h, transport).unwrap();
        net.register_socket_channels(h, read_channel(h), write_channel(h))
            .unwrap();
        h
    }

    fn wait(queue: &CompletionQueue, index: CompletionIndex) {
        assert!(queue.wait_for(index, WAIT), "channel {} never fired", index.0);
    }

    /// Listening server, connected client, and the accepted peer.
    fn connected_pair(
        net: &FlowNet,
        queue: &CompletionQueue,
    ) -> (ResourceHandle, ResourceHandle, ResourceHandle) {
        let server = socket(net, Transport::Tcp);
        net.listen(server, 0, 1).unwrap();
        let port = net.local_port(server).unwrap();

        let client = socket(net, Transport::Tcp);
        if net.connect(client, SocketAddress::localhost(port)).unwrap()
            == ConnectProgress::InProgress
        {
            net.arm(client, Operation::Connect, Timeout::Millis(2000))
                .unwrap();
            wait(queue, read_channel(client));
            assert_eq!(
                net.last_outcome(client, Direction::Read).unwrap(),
                Some(WaitOutcome::ConnectionSucceeded)
            );
        }

        net.arm(server, Operation::Accept, Timeout::Millis(2000))
            .unwrap();
        wait(queue, read_channel(server));
        assert_eq!(
            net.last_outcome(server, Direction::Read).unwrap(),
            Some(WaitOutcome::Ready)
        );

        let accepted = socket(net, Transport::Tcp);
        net.accept(accepted, server).unwrap();
        (server, client, accepted)
    }

    fn recv_exact(net: &FlowNet, queue: &CompletionQueue, h: ResourceHandle, n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; n];
        while out.len() < n {
            net.arm(h, Operation::Read, Timeout::Millis(2000)).unwrap();
            wait(queue, read_channel(h));
            assert!(!net.is_timed_out(h).unwrap());
            let want = n - out.len();
            let got = net.recv(h, &mut buf, want).unwrap();
            assert!(got > 0, "unexpected EOF");
            out.extend_from_slice(&buf[..got]);
        }
        out
    }

    #[test]
    fn test_tcp_transfer() {
        let (net, queue) = rig();
        let (_server, client, accepted) = connected_pair(&net, &queue);

        let payload: Vec<u8> = (0..200u8).collect();
        net.arm(client, Operation::Write, Timeout::Millis(2000))
            .unwrap();
        wait(&queue, write_channel(client));
        let sent = net.send(client, &payload, 0, payload.len()).unwrap();
        assert_eq!(sent, payload.len());

        assert_eq!(recv_exact(&net, &queue, accepted, payload.len()), payload);

        let peer = net.peer(accepted).unwrap();
        assert_eq!(peer.address.ip, [127, 0, 0, 1]);
    }

    #[test]
    fn test_send_with_offset() {
        let (net, queue) = rig();
        let (_server, client, accepted) = connected_pair(&net, &queue);

        let sent = net.send(client, b"xxhello", 2, 5).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(recv_exact(&net, &queue, accepted, 5), b"hello");

        assert!(matches!(
            net.send(client, b"abc", 2, 5),
            Err(FlowError::InvalidArgument(_))
        ));
        let mut small = [0u8; 2];
        assert!(matches!(
            net.recv(accepted, &mut small, 3),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_read_timeout() {
        let (net, queue) = rig();
        let (_server, _client, accepted) = connected_pair(&net, &queue);

        let begin = Instant::now();
        net.arm(accepted, Operation::Read, Timeout::Millis(150))
            .unwrap();
        wait(&queue, read_channel(accepted));
        let elapsed = begin.elapsed();

        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(2000));
        assert!(net.is_timed_out(accepted).unwrap());
        assert!(!net.has_data(accepted).unwrap());
    }

    #[test]
    fn test_ready_before_deadline() {
        let (net, queue) = rig();
        let (_server, client, accepted) = connected_pair(&net, &queue);

        let begin = Instant::now();
        net.arm(accepted, Operation::Read, Timeout::Millis(3000))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        net.send(client, b"!", 0, 1).unwrap();
        wait(&queue, read_channel(accepted));

        assert!(begin.elapsed() < Duration::from_millis(3000));
        assert_eq!(
            net.last_outcome(accepted, Direction::Read).unwrap(),
            Some(WaitOutcome::Ready)
        );
        assert!(net.has_data(accepted).unwrap());
    }

    #[test]
    fn test_connection_refused() {
        let (net, queue) = rig();

        // Grab an ephemeral port and release it so nothing listens there.
        let scratch = socket(&net, Transport::Tcp);
        net.bind(scratch, 0).unwrap();
        let port = net.local_port(scratch).unwrap();
        net.close(scratch).unwrap();

        let client = socket(&net, Transport::Tcp);
        match net.connect(client, SocketAddress::localhost(port)) {
            Err(FlowError::Os(e)) => assert_eq!(e, libc::ECONNREFUSED),
            Ok(ConnectProgress::InProgress) => {
                net.arm(client, Operation::Connect, Timeout::Millis(2000))
                    .unwrap();
                wait(&queue, read_channel(client));
                assert_eq!(
                    net.last_outcome(client, Direction::Read).unwrap(),
                    Some(WaitOutcome::ConnectionFailed)
                );
                assert!(net.is_connection_refused(client).unwrap());
            }
            other => panic!("unexpected connect result {:?}", other),
        }
    }

    #[test]
    fn test_peer_close_tears_down() {
        let (net, queue) = rig();
        let (_server, client, accepted) = connected_pair(&net, &queue);

        net.close(client).unwrap();
        net.arm(accepted, Operation::Read, Timeout::Millis(2000))
            .unwrap();
        wait(&queue, read_channel(accepted));

        let before = net.live_resources();
        assert!(!net.is_alive(accepted).unwrap());
        assert_eq!(net.live_resources(), before - 1);

        let mut buf = [0u8; 8];
        assert_eq!(
            net.recv(accepted, &mut buf, 8),
            Err(FlowError::ResourceClosed)
        );
        assert_eq!(
            net.arm(accepted, Operation::Read, Timeout::Never),
            Err(FlowError::ResourceClosed)
        );
    }

    #[test]
    fn test_double_close() {
        let (net, _queue) = rig();
        let h = socket(&net, Transport::Tcp);
        net.close(h).unwrap();
        assert_eq!(net.close(h), Err(FlowError::AlreadyClosed));

        assert_eq!(net.bind(h, 0), Err(FlowError::ResourceClosed));
        assert!(!net.is_alive(h).unwrap());
        assert!(net.is_timed_out(h).unwrap());
        assert!(!net.has_data(h).unwrap());

        net.discard(h).unwrap();
        assert_eq!(net.close(h), Err(FlowError::UnknownHandle));
    }

    #[test]
    fn test_rearm_rejected_and_close_is_prompt() {
        let (net, queue) = rig();
        let h = socket(&net, Transport::Udp);
        net.bind(h, 0).unwrap();

        net.arm(h, Operation::Read, Timeout::Never).unwrap();
        assert_eq!(
            net.arm(h, Operation::Read, Timeout::Millis(10)),
            Err(FlowError::OperationPending)
        );
        // The write side is independent.
        net.arm(h, Operation::Write, Timeout::Millis(1000)).unwrap();
        wait(&queue, write_channel(h));

        let begin = Instant::now();
        net.close(h).unwrap();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert!(!queue.try_take(read_channel(h)));
    }

    #[test]
    fn test_udp_round_trip() {
        let (net, queue) = rig();
        let receiver = socket(&net, Transport::Udp);
        net.bind(receiver, 0).unwrap();
        let port = net.local_port(receiver).unwrap();

        let sender = socket(&net, Transport::Udp);
        net.bind(sender, 0).unwrap();
        let sender_port = net.local_port(sender).unwrap();

        net.arm(receiver, Operation::Read, Timeout::Millis(2000))
            .unwrap();
        net.send_to(sender, b"ping", SocketAddress::localhost(port))
            .unwrap();
        wait(&queue, read_channel(receiver));

        let mut buf = [0u8; 16];
        let (n, from) = net.recv_from(receiver, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, SocketAddress::localhost(sender_port));
        assert!(net.is_alive(receiver).unwrap());
        assert!(matches!(
            net.connect(receiver, SocketAddress::localhost(port)),
            Err(FlowError::Unsupported(_))
        ));
    }

    #[test]
    fn test_resolver_localhost() {
        let (net, queue) = rig();
        let r = net.new_resolver().unwrap();
        net.enable_resolver(r).unwrap();
        net.register_resolution_channel(r, CompletionIndex(7000))
            .unwrap();

        net.resolve(r, "localhost").unwrap();
        wait(&queue, CompletionIndex(7000));
        assert_eq!(net.resolution_outcome(r), Ok(ResolveOutcome::Resolved));
        assert_eq!(net.resolved_address(r), Ok(Some([127, 0, 0, 1])));

        net.close_resolver(r).unwrap();
        assert_eq!(net.close_resolver(r), Err(FlowError::AlreadyClosed));
        assert_eq!(net.resolve(r, "localhost"), Err(FlowError::ResourceClosed));
    }

    #[test]
    fn test_wrong_kind_and_unknown() {
        let (net, _queue) = rig();
        let r = net.new_resolver().unwrap();
        assert_eq!(net.bind(r, 0), Err(FlowError::WrongKind));
        assert_eq!(net.close(r), Err(FlowError::WrongKind));
        assert_eq!(
            net.is_alive(ResourceHandle(424242)),
            Err(FlowError::UnknownHandle)
        );
    }

    #[test]
    fn test_allocation_limit() {
        let queue: Arc<dyn Host> = Arc::new(CompletionQueue::new(4));
        let net = FlowNet::with_config(queue, NetConfig::new().max_resources(2)).unwrap();
        let a = net.new_socket().unwrap();
        net.new_resolver().unwrap();
        assert_eq!(net.new_socket(), Err(FlowError::AllocationFailed));
        net.discard(a).unwrap();
        assert!(net.new_socket().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let host: Arc<dyn Host> = Arc::new(flownet_core::NullHost);
        assert!(matches!(
            FlowNet::with_config(host, NetConfig::new().max_resources(0)),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_drop_releases_everything() {
        let (net, _queue) = rig();
        let a = socket(&net, Transport::Tcp);
        net.arm(a, Operation::Read, Timeout::Never).unwrap();
        let r = net.new_resolver().unwrap();
        net.enable_resolver(r).unwrap();
        assert_eq!(net.live_resources(), 2);

        let begin = Instant::now();
        drop(net);
        assert!(begin.elapsed() < Duration::from_millis(500));
    }
}
