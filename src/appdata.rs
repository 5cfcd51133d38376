//! Per-connection scratch data shared between the connection and its
//! upcall dispatcher.
//!
//! Holds the liveness flag, the waiting-thread count, the emergency
//! wakeup pipe used to break a blocked `poll`, the currently-installed
//! [`HandshakeUpcallEnvironment`], and the negotiated ALPN protocol list.
//! Every field here is guarded by `mutex`; callers are required to hold
//! it before touching `upcall_env`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::log::{trace, warn};
use crate::upcall::HandshakeUpcallEnvironment;

/// At most one reader and one writer may block on a connection at once.
pub const MAX_WAITING_THREADS: u32 = 2;

#[derive(Debug)]
pub enum AppDataError {
    /// The wakeup pipe could not be created in non-blocking mode.
    PipeCreationFailed(std::io::Error),
    /// `install_upcall` was asked to install an environment for an fd that
    /// is already closed.
    FdClosed,
}

pub struct AppData {
    alive: AtomicBool,
    waiting_threads: AtomicU32,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
    mutex: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    upcall_env: Option<HandshakeUpcallEnvironment>,
    alpn_protocols: Option<Vec<u8>>,
}

impl AppData {
    pub fn new() -> Result<Self, AppDataError> {
        let (rfd, wfd) = make_nonblocking_pipe().map_err(AppDataError::PipeCreationFailed)?;
        Ok(Self {
            alive: AtomicBool::new(true),
            waiting_threads: AtomicU32::new(0),
            wakeup_read: rfd,
            wakeup_write: wfd,
            mutex: Mutex::new(Inner::default()),
        })
    }

    pub fn wakeup_read_fd(&self) -> RawFd {
        self.wakeup_read
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Caller must hold `mutex` for the duration of the upcall-bracketed
    /// region; this method itself does not lock so it composes with the
    /// upcall router's own `lock()` call.
    pub fn mutex(&self) -> &Mutex<Inner> {
        &self.mutex
    }

    pub fn install_upcall(
        &self,
        guard: &mut Inner,
        env: HandshakeUpcallEnvironment,
    ) -> Result<(), AppDataError> {
        if env.fd_is_closed() {
            return Err(AppDataError::FdClosed);
        }
        guard.upcall_env = Some(env);
        Ok(())
    }

    pub fn clear_upcall(&self, guard: &mut Inner) {
        guard.upcall_env = None;
    }

    pub fn upcall_env<'a>(&self, guard: &'a Inner) -> Option<&'a HandshakeUpcallEnvironment> {
        guard.upcall_env.as_ref()
    }

    /// Deep-copies `bytes` as the server's advertised ALPN protocol list.
    /// Always owns its copy, never a pointer into the caller's buffer, so
    /// that buffer may be freed at any time after this call returns.
    pub fn install_alpn(&self, guard: &mut Inner, bytes: &[u8]) {
        guard.alpn_protocols = Some(bytes.to_vec());
    }

    pub fn alpn_protocols<'a>(&self, guard: &'a Inner) -> Option<&'a [u8]> {
        guard.alpn_protocols.as_deref()
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.mutex.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn begin_wait(&self) -> bool {
        let prev = self.waiting_threads.fetch_add(1, Ordering::AcqRel);
        if prev >= MAX_WAITING_THREADS {
            self.waiting_threads.fetch_sub(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    pub fn end_wait(&self) {
        self.waiting_threads.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn waiting_threads(&self) -> u32 {
        self.waiting_threads.load(Ordering::Acquire)
    }

    /// Writes one byte to the wakeup pipe, preserving `errno` across the
    /// call: this runs from error-handling paths and must not clobber the
    /// reason for an original failure. A write that would block is
    /// ignored -- the pipe already holds a pending wakeup.
    pub fn notify(&self) {
        let saved_errno = std::io::Error::last_os_error();
        loop {
            // SAFETY: `wakeup_write` is a valid fd for this AppData's
            // entire lifetime.
            let rc = unsafe { libc::write(self.wakeup_write, [0u8].as_ptr().cast(), 1) };
            if rc >= 0 {
                break;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN) => break,
                _ => {
                    warn!("AppData::notify: wakeup pipe write failed");
                    break;
                }
            }
        }
        restore_errno(saved_errno);
    }

    /// Drains the wakeup pipe's read end back to zero pending bytes.
    pub fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` is a valid, correctly-sized buffer and
            // `wakeup_read` is open for this AppData's lifetime.
            let rc = unsafe {
                libc::read(self.wakeup_read, buf.as_mut_ptr().cast(), buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }

    /// Monotonic cancellation: sets `alive=false` and wakes up to
    /// [`MAX_WAITING_THREADS`] blocked threads. Never re-raises once
    /// cleared.
    pub fn interrupt(&self) {
        if self
            .alive
            .swap(false, Ordering::AcqRel)
        {
            trace!("AppData::interrupt: waking blocked threads");
        }
        for _ in 0..MAX_WAITING_THREADS {
            self.notify();
        }
    }
}

impl Drop for AppData {
    fn drop(&mut self) {
        // SAFETY: both ends were created by this AppData and are not
        // shared past its lifetime.
        unsafe {
            libc::close(self.wakeup_read);
            libc::close(self.wakeup_write);
        }
    }
}

pub use Inner as AppDataGuard;

fn make_nonblocking_pipe() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid 2-element out-array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    crate::bio::socket::set_nonblocking(fds[0])?;
    crate::bio::socket::set_nonblocking(fds[1])?;
    Ok((fds[0], fds[1]))
}

#[cfg(target_os = "linux")]
fn restore_errno(err: std::io::Error) {
    if let Some(code) = err.raw_os_error() {
        // SAFETY: writing the thread-local errno is always sound.
        unsafe {
            *libc::__errno_location() = code;
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn restore_errno(_err: std::io::Error) {
    // `errno`'s thread-local location isn't exposed portably by `libc`
    // outside glibc; callers on other platforms read the translated
    // `Error` this crate returns instead of raw `errno`, so the pipe
    // write itself is still safe to attempt -- only the "preserve the
    // caller's original errno" refinement is Linux-only.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_threads_bounded_by_two() {
        let app = AppData::new().unwrap();
        assert!(app.begin_wait());
        assert!(app.begin_wait());
        assert!(!app.begin_wait());
        app.end_wait();
        assert!(app.begin_wait());
    }

    #[test]
    fn interrupt_is_monotonic_and_drains_to_zero_pending() {
        let app = AppData::new().unwrap();
        assert!(app.is_alive());
        app.interrupt();
        assert!(!app.is_alive());
        app.interrupt(); // must not panic or re-raise
        assert!(!app.is_alive());
        app.drain_wakeup();
        assert_eq!(app.ctrl_pending(), 0);
    }

    #[test]
    fn install_and_clear_alpn_deep_copies() {
        let app = AppData::new().unwrap();
        let mut guard = app.lock();
        let mut bytes = vec![1u8, b'h'];
        app.install_alpn(&mut guard, &bytes);
        bytes[1] = b'x'; // mutate the caller's buffer after installing
        assert_eq!(app.alpn_protocols(&guard), Some(&[1u8, b'h'][..]));
    }

    impl AppData {
        fn ctrl_pending(&self) -> usize {
            let mut avail: libc::c_int = 0;
            // SAFETY: `avail` is a valid out-pointer.
            let rc = unsafe { libc::ioctl(self.wakeup_read, libc::FIONREAD, &mut avail) };
            if rc == 0 {
                avail.max(0) as usize
            } else {
                0
            }
        }
    }
}
