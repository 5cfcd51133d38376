//! Socket BIO: wraps a non-blocking file descriptor.
//!
//! `EWOULDBLOCK`/`EAGAIN` become [`BioResult::Retry`]; `EINTR` is
//! swallowed and the syscall retried without ever surfacing to the
//! caller. The fd is only closed on drop if this BIO was constructed as
//! the *owner* -- a BIO built from a borrowed fd (the common case: the
//! consumer owns the socket) just detaches.

use std::os::unix::io::RawFd;

use super::{Bio, BioResult, Ctrl};
use crate::error::Error;

pub struct SocketBio {
    fd: RawFd,
    owns_fd: bool,
    total_read: u64,
    total_written: u64,
}

impl SocketBio {
    /// Wrap `fd`, which the caller continues to own; dropping this BIO
    /// never closes it.
    pub fn borrowed(fd: RawFd) -> Self {
        Self {
            fd,
            owns_fd: false,
            total_read: 0,
            total_written: 0,
        }
    }

    /// Wrap `fd` and take ownership of it; dropping this BIO closes it.
    pub fn owned(fd: RawFd) -> Self {
        Self {
            fd,
            owns_fd: true,
            total_read: 0,
            total_written: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0)
    }
}

impl Drop for SocketBio {
    fn drop(&mut self) {
        if self.owns_fd {
            // SAFETY: `fd` is a valid, open descriptor owned exclusively
            // by this BIO for its entire lifetime.
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl Bio for SocketBio {
    fn read(&mut self, buf: &mut [u8]) -> BioResult {
        if buf.is_empty() {
            return BioResult::Ok(0);
        }
        loop {
            // SAFETY: `buf` is a valid, properly sized mutable slice and
            // `fd` is open for the duration of this call.
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len())
            };
            if n > 0 {
                self.total_read += n as u64;
                return BioResult::Ok(n as usize);
            }
            if n == 0 {
                return BioResult::Eof;
            }
            match Self::last_errno() {
                libc::EINTR => continue,
                libc::EWOULDBLOCK | libc::EAGAIN => return BioResult::Retry,
                _ => return BioResult::Err(Error::from(std::io::Error::last_os_error())),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> BioResult {
        if buf.is_empty() {
            return BioResult::Ok(0);
        }
        loop {
            // SAFETY: `buf` is a valid slice for `buf.len()` bytes and
            // `fd` is open for the duration of this call.
            let n = unsafe {
                libc::write(self.fd, buf.as_ptr().cast(), buf.len())
            };
            if n >= 0 {
                self.total_written += n as u64;
                return BioResult::Ok(n as usize);
            }
            match Self::last_errno() {
                libc::EINTR => continue,
                libc::EWOULDBLOCK | libc::EAGAIN => return BioResult::Retry,
                _ => return BioResult::Err(Error::from(std::io::Error::last_os_error())),
            }
        }
    }

    fn flush(&mut self) -> BioResult {
        BioResult::Ok(0)
    }

    fn ctrl(&mut self, cmd: Ctrl) -> usize {
        match cmd {
            Ctrl::Eof | Ctrl::Flush => 0,
            Ctrl::Pending => {
                let mut avail: libc::c_int = 0;
                // SAFETY: `avail` is a valid, correctly sized out-pointer.
                let rc = unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut avail) };
                if rc == 0 {
                    avail.max(0) as usize
                } else {
                    0
                }
            }
        }
    }

    fn total_read(&self) -> u64 {
        self.total_read
    }

    fn total_written(&self) -> u64 {
        self.total_written
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}

/// Set `fd` to non-blocking mode, the precondition for every [`SocketBio`]
/// operation above to behave as documented.
pub fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` is a valid descriptor for the duration of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: same as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
