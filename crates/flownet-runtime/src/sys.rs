//! # Raw socket calls
//!
//! Thin wrappers over the libc socket API, IPv4 only. Each function returns
//! the raw errno (or `EAI_*` code for name lookups) on failure and leaves
//! mapping to `FlowError` to the caller.
//!
//! Transfers always pass `MSG_DONTWAIT`: the caller only transfers after a
//! poller reported readiness, so a blocking transfer is never wanted.

use flownet_core::{ConnectProgress, SocketAddress, Transport};

use nix::errno::Errno;

use std::ffi::CStr;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Sentinel for "no descriptor".
pub const NO_FD: RawFd = -1;

const SOCKADDR_IN_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// `NI_MAXHOST` from `<netdb.h>`.
const MAX_HOST_NAME: usize = 1025;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
    } else {
        const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;
    }
}

// ioctl(fd, FIONBIO, &int)
nix::ioctl_write_ptr_bad!(fionbio, libc::FIONBIO, libc::c_int);

#[inline]
pub fn errno() -> i32 {
    Errno::last() as i32
}

/// True for the errno values a non-blocking call uses for "try later".
#[inline]
pub fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// Switch the descriptor in or out of non-blocking mode. Idempotent.
pub fn set_nonblocking(fd: RawFd, on: bool) -> Result<(), i32> {
    let flag: libc::c_int = on as libc::c_int;
    unsafe { fionbio(fd, &flag) }
        .map(|_| ())
        .map_err(|e| e as i32)
}

pub fn set_cloexec(fd: RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

pub fn close(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

fn to_sockaddr(addr: SocketAddress) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port.to_be();
    // The address bytes are already in network order.
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip);
    sa
}

fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddress {
    SocketAddress::new(sa.sin_addr.s_addr.to_ne_bytes(), u16::from_be(sa.sin_port))
}

/// Create an IPv4 socket with `SO_REUSEADDR` set.
pub fn open_socket(transport: Transport) -> Result<RawFd, i32> {
    let kind = match transport {
        Transport::Tcp => libc::SOCK_STREAM,
        Transport::Udp => libc::SOCK_DGRAM,
    };
    let fd = unsafe { libc::socket(libc::AF_INET, kind, 0) };
    if fd < 0 {
        return Err(errno());
    }
    set_cloexec(fd);

    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(fd)
}

/// Start a connect on a non-blocking descriptor.
pub fn connect(fd: RawFd, addr: SocketAddress) -> Result<ConnectProgress, i32> {
    let sa = to_sockaddr(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if ret == 0 {
        return Ok(ConnectProgress::Connected);
    }
    let e = errno();
    if e == libc::EINPROGRESS || is_would_block(e) {
        Ok(ConnectProgress::InProgress)
    } else {
        Err(e)
    }
}

/// Bind to `port` on all interfaces. Port 0 picks an ephemeral port.
pub fn bind(fd: RawFd, port: u16) -> Result<(), i32> {
    let sa = to_sockaddr(SocketAddress::new([0, 0, 0, 0], port));
    let ret = unsafe {
        libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if ret != 0 {
        return Err(errno());
    }
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<(), i32> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(errno());
    }
    Ok(())
}

/// Accept one pending connection.
pub fn accept(fd: RawFd) -> Result<RawFd, i32> {
    let client = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
    if client < 0 {
        return Err(errno());
    }
    set_cloexec(client);
    Ok(client)
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> Result<usize, i32> {
    let ret = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

pub fn send(fd: RawFd, buf: &[u8]) -> Result<usize, i32> {
    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> Result<(usize, SocketAddress), i32> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
            &mut sa as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok((ret as usize, from_sockaddr(&sa)))
}

pub fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddress) -> Result<usize, i32> {
    let sa = to_sockaddr(addr);
    let ret = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

/// Peek one byte without consuming it. True when the peer has closed
/// (EOF) or reset the connection.
pub fn peer_closed(fd: RawFd) -> bool {
    let mut byte = 0u8;
    let ret = unsafe {
        libc::recv(
            fd,
            &mut byte as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    ret == 0 || (ret < 0 && errno() == libc::ECONNRESET)
}

/// `poll(2)`; returns the number of descriptors with events.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> Result<usize, i32> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        return Err(errno());
    }
    Ok(ret as usize)
}

/// Zero-timeout readability probe.
pub fn readable_now(fd: RawFd) -> Result<bool, i32> {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    Ok(poll(&mut fds, 0)? > 0 && fds[0].revents & libc::POLLIN != 0)
}

/// Pending error on the socket (`SO_ERROR`); 0 means none.
pub fn socket_error(fd: RawFd) -> Result<i32, i32> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(errno());
    }
    Ok(value)
}

pub fn peer_address(fd: RawFd) -> Result<SocketAddress, i32> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe { libc::getpeername(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret != 0 {
        return Err(errno());
    }
    Ok(from_sockaddr(&sa))
}

pub fn local_address(fd: RawFd) -> Result<SocketAddress, i32> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret != 0 {
        return Err(errno());
    }
    Ok(from_sockaddr(&sa))
}

/// Blocking forward lookup. `Ok(None)` when the name exists but has no
/// IPv4 address; `Err` carries the `EAI_*` code.
pub fn resolve_ipv4(host: &CStr) -> Result<Option<[u8; 4]>, i32> {
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_INET;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(host.as_ptr(), ptr::null(), &hints, &mut res) };
    if rc != 0 {
        return Err(rc);
    }

    let mut found = None;
    let mut cur = res;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if ai.ai_family == libc::AF_INET && !ai.ai_addr.is_null() {
            let sa = unsafe { &*(ai.ai_addr as *const libc::sockaddr_in) };
            found = Some(sa.sin_addr.s_addr.to_ne_bytes());
            break;
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };
    Ok(found)
}

/// Lookup failures that mean the resolver subsystem itself is broken,
/// as opposed to "no such host".
pub fn is_fatal_lookup(code: i32) -> bool {
    code == libc::EAI_FAIL || code == libc::EAI_MEMORY || code == libc::EAI_SYSTEM
}

/// Blocking reverse lookup; the name must exist (`NI_NAMEREQD`).
pub fn name_for_address(ip: [u8; 4]) -> Result<String, i32> {
    let sa = to_sockaddr(SocketAddress::new(ip, 0));
    let mut host = [0 as libc::c_char; MAX_HOST_NAME];
    let rc = unsafe {
        libc::getnameinfo(
            &sa as *const _ as *const libc::sockaddr,
            SOCKADDR_IN_LEN,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return Err(rc);
    }
    Ok(unsafe { CStr::from_ptr(host.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_sockaddr_conversion() {
        let addr = SocketAddress::new([10, 1, 2, 3], 8080);
        let sa = to_sockaddr(addr);
        assert_eq!(sa.sin_port, 8080u16.to_be());
        assert_eq!(from_sockaddr(&sa), addr);
    }

    #[test]
    fn test_bind_ephemeral_reports_port() {
        let fd = open_socket(Transport::Tcp).unwrap();
        bind(fd, 0).unwrap();
        let local = local_address(fd).unwrap();
        assert_ne!(local.port, 0);
        close(fd);
    }

    #[test]
    fn test_nonblocking_connect_to_closed_port() {
        // Reserve a port, then close it so nothing listens there.
        let scratch = open_socket(Transport::Tcp).unwrap();
        bind(scratch, 0).unwrap();
        let port = local_address(scratch).unwrap().port;
        close(scratch);

        let fd = open_socket(Transport::Tcp).unwrap();
        set_nonblocking(fd, true).unwrap();
        match connect(fd, SocketAddress::localhost(port)) {
            Ok(ConnectProgress::InProgress) | Err(_) => {}
            Ok(ConnectProgress::Connected) => panic!("connected to a closed port"),
        }
        close(fd);
    }

    #[test]
    fn test_recv_on_idle_socket_would_block() {
        let fd = open_socket(Transport::Udp).unwrap();
        bind(fd, 0).unwrap();
        let mut buf = [0u8; 8];
        let err = recv(fd, &mut buf).unwrap_err();
        assert!(is_would_block(err));
        assert!(!readable_now(fd).unwrap());
        close(fd);
    }

    #[test]
    fn test_resolve_localhost() {
        let name = CString::new("localhost").unwrap();
        assert_eq!(resolve_ipv4(&name), Ok(Some([127, 0, 0, 1])));
    }

    #[test]
    fn test_fatal_lookup_codes() {
        assert!(is_fatal_lookup(libc::EAI_FAIL));
        assert!(!is_fatal_lookup(libc::EAI_NONAME));
    }
}
