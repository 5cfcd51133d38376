//! Memory-pair BIO: two coupled halves backed by bounded `VecDeque`s.
//!
//! Used by the engine I/O surface so a caller can drive the TLS core
//! purely over byte buffers it owns, with no socket involved. Reading
//! one half consumes bytes written to its peer; a full peer buffer
//! makes `write` retry, and a closed, drained peer makes `read` report
//! EOF -- the same backpressure semantics a socket BIO gives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Bio, BioResult, Ctrl};

struct Shared {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
}

/// One side of a memory-pair BIO. `write`s to this half land in `outbound`
/// (read by the peer); `read`s from this half drain `inbound` (written by
/// the peer).
pub struct MemoryBioHalf {
    inbound: Arc<Mutex<Shared>>,
    outbound: Arc<Mutex<Shared>>,
    total_read: u64,
    total_written: u64,
}

impl MemoryBioHalf {
    /// Build a connected pair, each side buffering up to `capacity` bytes
    /// of unread data before `write` starts retrying.
    pub fn pair(capacity: usize) -> (MemoryBioHalf, MemoryBioHalf) {
        let a_to_b = Arc::new(Mutex::new(Shared {
            buf: VecDeque::new(),
            capacity,
            writer_closed: false,
        }));
        let b_to_a = Arc::new(Mutex::new(Shared {
            buf: VecDeque::new(),
            capacity,
            writer_closed: false,
        }));

        let a = MemoryBioHalf {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
            total_read: 0,
            total_written: 0,
        };
        let b = MemoryBioHalf {
            inbound: a_to_b,
            outbound: b_to_a,
            total_read: 0,
            total_written: 0,
        };
        (a, b)
    }

    /// Mark this half as done writing; the peer's next `read` once its
    /// buffer drains will observe EOF instead of retry.
    pub fn close_write(&self) {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).writer_closed = true;
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().unwrap_or_else(|p| p.into_inner()).buf.len()
    }
}

impl Bio for MemoryBioHalf {
    fn read(&mut self, buf: &mut [u8]) -> BioResult {
        if buf.is_empty() {
            return BioResult::Ok(0);
        }
        let mut shared = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
        if shared.buf.is_empty() {
            return if shared.writer_closed {
                BioResult::Eof
            } else {
                BioResult::Retry
            };
        }
        let n = buf.len().min(shared.buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = shared.buf.pop_front().unwrap();
        }
        drop(shared);
        self.total_read += n as u64;
        BioResult::Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> BioResult {
        if buf.is_empty() {
            return BioResult::Ok(0);
        }
        let mut shared = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        let room = shared.capacity.saturating_sub(shared.buf.len());
        if room == 0 {
            return BioResult::Retry;
        }
        let n = buf.len().min(room);
        shared.buf.extend(buf[..n].iter().copied());
        drop(shared);
        self.total_written += n as u64;
        BioResult::Ok(n)
    }

    fn flush(&mut self) -> BioResult {
        BioResult::Ok(0)
    }

    fn ctrl(&mut self, cmd: Ctrl) -> usize {
        match cmd {
            Ctrl::Eof => {
                let shared = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
                (shared.writer_closed && shared.buf.is_empty()) as usize
            }
            Ctrl::Flush => 0,
            Ctrl::Pending => self.inbound.lock().unwrap_or_else(|p| p.into_inner()).buf.len(),
        }
    }

    fn total_read(&self) -> u64 {
        self.total_read
    }

    fn total_written(&self) -> u64 {
        self.total_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let (mut a, mut b) = MemoryBioHalf::pair(4096);
        assert!(matches!(a.write(b"hello"), BioResult::Ok(5)));
        let mut buf = [0u8; 5];
        assert!(matches!(b.read(&mut buf), BioResult::Ok(5)));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_retries_on_empty_buffer() {
        let (_a, mut b) = MemoryBioHalf::pair(4096);
        let mut buf = [0u8; 5];
        assert!(b.read(&mut buf).is_retry());
    }

    #[test]
    fn read_eof_after_peer_closes_and_drains() {
        let (mut a, mut b) = MemoryBioHalf::pair(4096);
        a.write(b"x").unwrap_ok();
        a.close_write();
        let mut buf = [0u8; 1];
        assert!(matches!(b.read(&mut buf), BioResult::Ok(1)));
        assert!(b.read(&mut buf).is_eof());
    }

    #[test]
    fn write_retries_when_peer_buffer_full() {
        let (mut a, _b) = MemoryBioHalf::pair(2);
        assert!(matches!(a.write(b"ab"), BioResult::Ok(2)));
        assert!(a.write(b"c").is_retry());
    }

    trait UnwrapOk {
        fn unwrap_ok(self);
    }
    impl UnwrapOk for BioResult {
        fn unwrap_ok(self) {
            match self {
                BioResult::Ok(_) => {}
                other => panic!("expected Ok, got {other:?}"),
            }
        }
    }
}
