//! A pass-through write filter applying one or two [`TokenBucket`]s (a
//! shared client-wide bucket and/or a per-peer bucket) before handing
//! bytes to an unreliable datagram sink. Reads, control queries and
//! metadata are expected to pass straight through whatever wraps this
//! filter; this crate only concerns itself with the write side.

mod token_bucket;

pub use token_bucket::TokenBucket;

use std::io;
use std::sync::Arc;

/// Minimal datagram-sending capability the rate limiter sits in front of.
/// `campagnol-dtls` implements this for its UDP peer socket.
pub trait DatagramWrite {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize>;
}

/// Charges zero, one, or two token buckets before forwarding a write.
#[derive(Clone, Default)]
pub struct RateLimiter {
    client_wide: Option<Arc<TokenBucket>>,
    per_peer: Option<Arc<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(client_wide: Option<Arc<TokenBucket>>, per_peer: Option<Arc<TokenBucket>>) -> Self {
        Self {
            client_wide,
            per_peer,
        }
    }

    pub fn charge(&self, len: usize) {
        if let Some(b) = &self.client_wide {
            b.count(len);
        }
        if let Some(b) = &self.per_peer {
            b.count(len);
        }
    }
}

/// Wraps any [`DatagramWrite`] so every outgoing datagram is rate-limited
/// before it reaches the underlying sink.
pub struct RateLimitedSink<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S: DatagramWrite> RateLimitedSink<S> {
    pub fn new(inner: S, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: DatagramWrite> DatagramWrite for RateLimitedSink<S> {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
        self.limiter.charge(buf.len());
        self.inner.send_datagram(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<Vec<u8>>>);

    impl DatagramWrite for Recorder {
        fn send_datagram(&self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    #[test]
    fn forwards_after_charging() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let limiter = RateLimiter::new(Some(Arc::new(TokenBucket::new(10_000, 100_000.0, 0))), None);
        let sink = RateLimitedSink::new(recorder, limiter);
        sink.send_datagram(b"hello").unwrap();
        assert_eq!(sink.get_ref().0.lock().unwrap().as_slice(), [b"hello".to_vec()]);
    }
}
