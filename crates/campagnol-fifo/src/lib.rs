//! A bounded FIFO queue of whole datagrams, used to feed a DTLS library's
//! blocking read side from a producer thread (`SocketIngress`) without the
//! consumer (the per-peer reader task) ever touching the socket directly.
//!
//! This is the Rust translation of the original's custom OpenSSL `BIO`
//! memory-FIFO: a fixed number of slots, each holding one datagram, with a
//! drop-tail mode for use before a handshake completes and a blocking mode
//! with hysteresis-based wakeup afterwards.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A write into a full, non-drop-tail queue blocks until occupancy falls
/// below `size / HYSTERESIS_DIVISOR`, avoiding thrash between one writer
/// and one reader trading single-slot wakeups.
const HYSTERESIS_DIVISOR: usize = 10;

struct Inner {
    slots: VecDeque<Vec<u8>>,
    capacity: usize,
    data_size: usize,
    drop_tail: bool,
    closed: bool,
    eof: bool,
    recv_timeout: Option<Duration>,
    recv_timer_expired: bool,
}

/// Bounded queue of owned byte buffers, parameterized by slot count
/// (`capacity`) and a per-slot size hint (`data_size`).
pub struct FifoQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Outcome of a [`FifoQueue::read`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A datagram was copied into the caller's buffer, consuming
    /// `usize` bytes of it (truncated if the caller's buffer was smaller
    /// than the stored datagram).
    Data(usize),
    /// The queue's configured receive timeout elapsed before any datagram
    /// arrived. Equivalent to OpenSSL's `BIO_should_retry`: the caller
    /// should treat this as a retryable condition, not an error.
    TimedOut,
    /// A zero-length datagram was read: the in-band wakeup used to force a
    /// blocked reader out without delivering real data (session teardown).
    ZeroLength,
}

impl FifoQueue {
    pub fn new(capacity: usize, data_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                capacity,
                data_size,
                drop_tail: false,
                closed: false,
                eof: false,
                recv_timeout: Some(Duration::from_millis(250)),
                recv_timer_expired: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Write a whole datagram into the queue.
    ///
    /// If the queue is full and drop-tail is enabled, the datagram is
    /// silently discarded and the call still reports success with the
    /// submitted length (matching the memory-semantics contract of the
    /// original BIO: writes "always work"). If drop-tail is disabled, the
    /// call blocks until space is available.
    ///
    /// Oversize datagrams (longer than the configured `data_size` hint)
    /// are still stored in full: the hint only informs pre-allocation,
    /// and Rust's allocator aborts rather than returning a recoverable
    /// failure, so the historical "truncate on allocation failure"
    /// fallback has no reachable path here.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut guard = self.inner.lock();
        if guard.slots.len() >= guard.capacity {
            if guard.drop_tail {
                tracing::trace!(capacity = guard.capacity, "fifo full, dropping datagram");
                return buf.len();
            }
            // Wake only once occupancy has fallen well below capacity, so one
            // reader draining one slot at a time doesn't thrash this writer.
            let low_water = guard.capacity / HYSTERESIS_DIVISOR;
            tracing::trace!(capacity = guard.capacity, low_water, "fifo full, blocking writer");
            while guard.slots.len() > low_water {
                self.not_full.wait(&mut guard);
            }
        }
        let mut item = Vec::with_capacity(buf.len().max(guard.data_size));
        item.extend_from_slice(buf);
        guard.slots.push_back(item);
        self.not_empty.notify_one();
        buf.len()
    }

    /// A recognized in-band wakeup: pushes a zero-length datagram so a
    /// blocked reader returns [`ReadOutcome::ZeroLength`] without being
    /// handed real data. Bypasses drop-tail and the capacity check so
    /// teardown can never be starved by a full queue.
    pub fn write_zero_length(&self) {
        let mut guard = self.inner.lock();
        guard.slots.push_back(Vec::new());
        self.not_empty.notify_one();
    }

    /// Blocking read of the next datagram. Honors the configured
    /// recv-timeout: if no datagram arrives in time, sets the
    /// recv-timer-expired flag (retrievable via [`FifoQueue::take_recv_timer_expired`])
    /// and returns [`ReadOutcome::TimedOut`].
    pub fn read(&self, out: &mut [u8]) -> ReadOutcome {
        let mut guard = self.inner.lock();
        if guard.slots.is_empty() {
            let timeout = guard.recv_timeout;
            match timeout {
                Some(d) => {
                    let deadline = Instant::now() + d;
                    loop {
                        if !guard.slots.is_empty() {
                            break;
                        }
                        let now = Instant::now();
                        if now >= deadline {
                            guard.recv_timer_expired = true;
                            return ReadOutcome::TimedOut;
                        }
                        let remaining = deadline - now;
                        let timed_out = self.not_empty.wait_for(&mut guard, remaining).timed_out();
                        if timed_out && guard.slots.is_empty() {
                            guard.recv_timer_expired = true;
                            return ReadOutcome::TimedOut;
                        }
                    }
                }
                None => {
                    while guard.slots.is_empty() {
                        self.not_empty.wait(&mut guard);
                    }
                }
            }
        }

        let item = guard.slots.pop_front().expect("checked non-empty above");
        self.not_full.notify_one();
        if item.is_empty() {
            return ReadOutcome::ZeroLength;
        }
        let n = item.len().min(out.len());
        out[..n].copy_from_slice(&item[..n]);
        ReadOutcome::Data(n)
    }

    pub fn reset(&self) {
        let mut guard = self.inner.lock();
        guard.slots.clear();
        guard.eof = false;
        self.not_full.notify_all();
    }

    /// Whether [`FifoQueue::set_eof`] has marked this queue as having
    /// reached end-of-stream. Independent of `slots` occupancy: an empty
    /// queue is the ordinary idle state, not EOF, so this must not be
    /// inferred from emptiness.
    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    pub fn set_eof(&self, eof: bool) {
        self.inner.lock().eof = eof;
    }

    pub fn get_close(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn set_close(&self, closed: bool) {
        self.inner.lock().closed = closed;
    }

    /// Sum of the sizes of all currently queued datagrams.
    pub fn pending_bytes(&self) -> usize {
        self.inner.lock().slots.iter().map(|s| s.len()).sum()
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().recv_timeout = timeout;
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.inner.lock().recv_timeout
    }

    pub fn take_recv_timer_expired(&self) -> bool {
        let mut guard = self.inner.lock();
        std::mem::replace(&mut guard.recv_timer_expired, false)
    }

    pub fn set_drop_tail(&self, drop_tail: bool) {
        self.inner.lock().drop_tail = drop_tail;
    }

    pub fn drop_tail(&self) -> bool {
        self.inner.lock().drop_tail
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_orders_reads_like_writes() {
        let q = FifoQueue::new(8, 64);
        for i in 0..5u8 {
            q.write(&[i; 4]);
        }
        let mut out = [0u8; 64];
        for i in 0..5u8 {
            match q.read(&mut out) {
                ReadOutcome::Data(n) => assert_eq!(&out[..n], &[i; 4]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn drop_tail_discards_when_full_and_leaves_queue_unchanged() {
        let q = FifoQueue::new(2, 64);
        q.set_drop_tail(true);
        q.write(&[1]);
        q.write(&[2]);
        assert_eq!(q.len(), 2);
        let reported = q.write(&[3, 3, 3]);
        assert_eq!(reported, 3); // reports submitted length even though dropped
        assert_eq!(q.len(), 2); // queue unchanged
        let mut out = [0u8; 8];
        assert_eq!(q.read(&mut out), ReadOutcome::Data(1));
        assert_eq!(out[0], 1);
    }

    #[test]
    fn blocking_write_unblocks_after_read_frees_space() {
        let q = Arc::new(FifoQueue::new(1, 64));
        q.write(&[1]);
        let q2 = q.clone();
        let writer = thread::spawn(move || {
            q2.write(&[2]);
        });
        thread::sleep(Duration::from_millis(20));
        let mut out = [0u8; 8];
        assert_eq!(q.read(&mut out), ReadOutcome::Data(1));
        writer.join().unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn read_times_out_and_sets_retry_flag() {
        let q = FifoQueue::new(4, 64);
        q.set_recv_timeout(Some(Duration::from_millis(10)));
        let mut out = [0u8; 8];
        assert_eq!(q.read(&mut out), ReadOutcome::TimedOut);
        assert!(q.take_recv_timer_expired());
        assert!(!q.take_recv_timer_expired());
    }

    #[test]
    fn zero_length_write_wakes_reader_without_data() {
        let q = FifoQueue::new(4, 64);
        q.write_zero_length();
        let mut out = [0u8; 8];
        assert_eq!(q.read(&mut out), ReadOutcome::ZeroLength);
    }

    #[test]
    fn is_eof_reflects_the_stored_flag_not_queue_emptiness() {
        let q = FifoQueue::new(4, 64);
        assert!(!q.is_eof()); // empty, but not eof
        q.write(&[1, 2, 3]);
        assert!(!q.is_eof()); // non-empty, still not eof
        q.set_eof(true);
        assert!(q.is_eof()); // now eof, regardless of occupancy
        q.reset();
        assert!(!q.is_eof()); // reset clears it
    }

    #[test]
    fn pending_bytes_sums_queued_sizes() {
        let q = FifoQueue::new(4, 64);
        q.write(&[1, 2, 3]);
        q.write(&[4, 5]);
        assert_eq!(q.pending_bytes(), 5);
    }
}
