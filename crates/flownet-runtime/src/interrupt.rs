//! `Interrupt` - wakes a thread blocked in `poll(2)`.
//!
//! Each poller includes the interrupt's read descriptor in its poll set.
//! Firing makes that descriptor readable, so a close can cut an indefinite
//! wait short without touching the socket descriptor the poller watches.
//!
//! Coalescing: firing twice before anyone looks is the same as firing once
//! (eventfd counter semantics). On platforms without eventfd a pipe is used.

use flownet_core::{FlowError, FlowResult};

use crate::sys;

use std::os::unix::io::RawFd;

pub struct Interrupt {
    read_fd: RawFd,
    write_fd: RawFd,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn open_pair() -> Result<(RawFd, RawFd), i32> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(sys::errno());
            }
            Ok((fd, fd))
        }
    } else {
        fn open_pair() -> Result<(RawFd, RawFd), i32> {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(sys::errno());
            }
            for &fd in &fds {
                sys::set_cloexec(fd);
                sys::set_nonblocking(fd, true)?;
            }
            Ok((fds[0], fds[1]))
        }
    }
}

impl Interrupt {
    /// Create a new, unfired interrupt. Owns its descriptors.
    pub fn create() -> FlowResult<Self> {
        let (read_fd, write_fd) = open_pair().map_err(FlowError::Os)?;
        Ok(Self { read_fd, write_fd })
    }

    /// Descriptor to add to a poll set with `POLLIN`.
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make `fd()` readable. Never blocks.
    pub fn fire(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN: counter (or pipe) is full, so a wakeup is already pending.
        if ret < 0 && !sys::is_would_block(sys::errno()) {
            flownet_core::kwarn!("interrupt write failed: errno {}", sys::errno());
        }
    }

    /// True once `fire()` has been called. Does not consume the signal.
    pub fn is_fired(&self) -> bool {
        sys::readable_now(self.read_fd).unwrap_or(false)
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        sys::close(self.read_fd);
        if self.write_fd != self.read_fd {
            sys::close(self.write_fd);
        }
        self.read_fd = sys::NO_FD;
        self.write_fd = sys::NO_FD;
    }
}
