//! flownet Echo Server
//!
//! Single-threaded TCP echo server. All waiting happens on flownet's
//! poller threads; the main thread only reacts to completion indices
//! drained from a `CompletionQueue`.
//!
//! Channel layout: a socket handle `h` reports read-side completions
//! (accept, read) on index `2h` and write-side completions on `2h + 1`.
//!
//! Usage:
//!     cargo build --release -p flownet-echo
//!     ./target/release/flownet-echo [port] [idle_timeout_ms]
//!
//! Test with:
//!     echo "hello" | nc localhost 9998

use flownet_core::{
    kerror, kinfo, kprint, kprintln, CompletionIndex, FlowError, FlowResult, Host, Operation,
    ResourceHandle, Timeout, Transport,
};
use flownet_runtime::{CompletionQueue, FlowNet, NetConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUF_SIZE: usize = 4096;

fn read_channel(h: ResourceHandle) -> CompletionIndex {
    CompletionIndex(h.0 * 2)
}

fn write_channel(h: ResourceHandle) -> CompletionIndex {
    CompletionIndex(h.0 * 2 + 1)
}

/// Inverse of the channel layout: (handle, is_write_side).
fn decode(idx: CompletionIndex) -> (ResourceHandle, bool) {
    (ResourceHandle(idx.0 / 2), idx.0 % 2 == 1)
}

// ── Per-connection state ──

struct Conn {
    buf: Box<[u8; BUF_SIZE]>,
    /// Bytes received and not yet echoed
    pending: usize,
}

#[derive(Default)]
struct Stats {
    accepts: u64,
    recvs: u64,
    sends: u64,
    closes: u64,
    timeouts: u64,
    bytes: u64,
    errors: u64,
}

impl Stats {
    fn print(&self, conns: usize, elapsed_secs: f64) {
        kinfo!(
            "[{:.1}s] conns={} accepts={} recv={} send={} close={} idle={} bytes={} err={}",
            elapsed_secs,
            conns,
            self.accepts,
            self.recvs,
            self.sends,
            self.closes,
            self.timeouts,
            self.bytes,
            self.errors,
        );
    }
}

struct Server {
    net: FlowNet,
    listener: ResourceHandle,
    conns: HashMap<ResourceHandle, Conn>,
    idle: Timeout,
    stats: Stats,
}

impl Server {
    fn open_socket(&self) -> FlowResult<ResourceHandle> {
        let h = self.net.new_socket()?;
        self.net.enable_socket(h, Transport::Tcp)?;
        self.net
            .register_socket_channels(h, read_channel(h), write_channel(h))?;
        Ok(h)
    }

    fn on_accept(&mut self) -> FlowResult<()> {
        let conn = self.open_socket()?;
        if let Err(e) = self.net.accept(conn, self.listener) {
            let _ = self.net.close(conn);
            let _ = self.net.discard(conn);
            return Err(e);
        }
        self.stats.accepts += 1;
        if let Ok(peer) = self.net.peer(conn) {
            kinfo!("accepted {} as {}", peer.address, conn);
        }
        self.conns.insert(
            conn,
            Conn {
                buf: Box::new([0u8; BUF_SIZE]),
                pending: 0,
            },
        );
        self.net.arm(conn, Operation::Read, self.idle)
    }

    fn on_readable(&mut self, h: ResourceHandle) -> FlowResult<()> {
        if self.net.is_timed_out(h)? {
            if self.net.is_alive(h)? {
                self.stats.timeouts += 1;
            }
            return self.drop_conn(h);
        }
        let Some(conn) = self.conns.get_mut(&h) else {
            return Ok(());
        };
        let n = self.net.recv(h, &mut conn.buf[..], BUF_SIZE)?;
        if n == 0 {
            return self.drop_conn(h);
        }
        self.stats.recvs += 1;
        self.stats.bytes += n as u64;
        conn.pending = n;
        self.net.arm(h, Operation::Write, Timeout::Millis(5000))
    }

    fn on_writable(&mut self, h: ResourceHandle) -> FlowResult<()> {
        let Some(conn) = self.conns.get_mut(&h) else {
            return Ok(());
        };
        let sent = self.net.send(h, &conn.buf[..], 0, conn.pending)?;
        self.stats.sends += 1;
        if sent < conn.pending {
            conn.buf.copy_within(sent..conn.pending, 0);
            conn.pending -= sent;
            return self.net.arm(h, Operation::Write, Timeout::Millis(5000));
        }
        conn.pending = 0;
        self.net.arm(h, Operation::Read, self.idle)
    }

    fn drop_conn(&mut self, h: ResourceHandle) -> FlowResult<()> {
        self.conns.remove(&h);
        self.stats.closes += 1;
        match self.net.close(h) {
            Ok(()) | Err(FlowError::AlreadyClosed) => {}
            Err(e) => return Err(e),
        }
        self.net.discard(h)
    }

    fn dispatch(&mut self, idx: CompletionIndex) {
        let (h, write_side) = decode(idx);
        let result = if h == self.listener {
            let r = self.on_accept();
            // Keep accepting whatever happened to this one.
            let rearm = self.net.arm(self.listener, Operation::Accept, Timeout::Never);
            r.and(rearm)
        } else if write_side {
            self.on_writable(h)
        } else {
            self.on_readable(h)
        };

        if let Err(e) = result {
            self.stats.errors += 1;
            kerror!("{}: {}", h, e);
            if h != self.listener && self.conns.contains_key(&h) {
                let _ = self.drop_conn(h);
            }
        }
    }
}

static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() {
    kprint::init();
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9998);
    let idle_ms: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(30_000);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    if let Err(e) = run(port, Timeout::Millis(idle_ms)) {
        kerror!("flownet-echo: {}", e);
        std::process::exit(1);
    }
}

fn run(port: u16, idle: Timeout) -> FlowResult<()> {
    let config = NetConfig::from_env();
    let queue = Arc::new(CompletionQueue::from_config(&config));
    let host: Arc<dyn Host> = queue.clone();
    let net = FlowNet::with_config(host, config)?;

    let listener = net.new_socket()?;
    net.enable_socket(listener, Transport::Tcp)?;
    net.register_socket_channels(listener, read_channel(listener), write_channel(listener))?;
    net.listen(listener, port, 128)?;
    net.arm(listener, Operation::Accept, Timeout::Never)?;
    kprintln!(
        "flownet-echo: listening on 0.0.0.0:{} (requested {})",
        net.local_port(listener)?,
        port
    );

    let mut server = Server {
        net,
        listener,
        conns: HashMap::new(),
        idle,
        stats: Stats::default(),
    };

    let start = Instant::now();
    let mut last_stats = start;

    // ── Event loop ──
    while RUNNING.load(Ordering::Relaxed) {
        if let Some(idx) = queue.wait_any(Duration::from_millis(500)) {
            server.dispatch(idx);
        }

        let now = Instant::now();
        if now.duration_since(last_stats).as_secs() >= 5 {
            server
                .stats
                .print(server.conns.len(), now.duration_since(start).as_secs_f64());
            last_stats = now;
        }
    }

    kinfo!("flownet-echo: shutting down");
    server
        .stats
        .print(server.conns.len(), start.elapsed().as_secs_f64());
    if queue.overflowed() > 0 {
        kerror!("{} completions were dropped", queue.overflowed());
    }
    Ok(())
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
