//! `Peer`/`PeerTable`: the per-peer record described in `spec.md` §3 and
//! the shared structure that indexes it by VPN IP and by real endpoint.
//!
//! Peers are reference-counted via `Arc` rather than a hand-rolled
//! incr/decr-ref pair: the table holds one canonical `Arc<Peer>`, callers
//! that look a peer up hold a cloned `Arc` for as long as they work with
//! it, and the struct is freed by the ordinary `Drop` chain once the
//! table's own entry is removed (at the `Closed` transition) and every
//! borrowed clone has gone out of scope — the "destroyed exactly when
//! refcount reaches zero" invariant falls out of `Arc` for free instead
//! of needing a recursive global lock (see `DESIGN.md`).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use campagnol_fifo::FifoQueue;

/// `spec.md` §3 `PeerRecord` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Punching,
    Linked,
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdvAnswer {
    Ans(SocketAddrV4),
    Rej,
}

struct Guarded {
    state: PeerState,
    real_addr: Option<SocketAddrV4>,
    rdv_answer: Option<RdvAnswer>,
    last_activity: Instant,
    last_keepalive_sent: Instant,
}

/// A live peer. `vpn_ip` and `is_dtls_initiator` are fixed at creation;
/// everything else lives behind the per-peer mutex plus the two FIFOs,
/// which have their own internal locking.
pub struct Peer {
    pub vpn_ip: Ipv4Addr,
    pub is_dtls_initiator: bool,
    guarded: Mutex<Guarded>,
    cond_connected: Condvar,
    /// Encrypted datagrams destined for this peer's DTLS session, fed by
    /// `SocketIngress`. `Arc`-wrapped so it can be moved into the DTLS
    /// transport for the session task's lifetime while `SocketIngress`
    /// keeps writing to it through the same `Peer`.
    pub read_fifo: Arc<FifoQueue>,
    /// Plaintext packets awaiting encryption, fed by `TunIngress`; drop-tail
    /// until the handshake completes (§4.5).
    pub out_queue: FifoQueue,
}

impl Peer {
    pub fn new(vpn_ip: Ipv4Addr, is_dtls_initiator: bool, state: PeerState, fifo_size: usize, now: Instant) -> Arc<Self> {
        let read_fifo = Arc::new(FifoQueue::new(fifo_size, campagnol_proto::MESSAGE_LEN.max(1500)));
        let out_queue = FifoQueue::new(fifo_size, 1500);
        out_queue.set_drop_tail(true);
        Arc::new(Self {
            vpn_ip,
            is_dtls_initiator,
            guarded: Mutex::new(Guarded {
                state,
                real_addr: None,
                rdv_answer: None,
                last_activity: now,
                last_keepalive_sent: now,
            }),
            cond_connected: Condvar::new(),
            read_fifo,
            out_queue,
        })
    }

    pub fn state(&self) -> PeerState {
        self.guarded.lock().state
    }

    pub fn set_state(&self, state: PeerState) {
        self.guarded.lock().state = state;
        if state != PeerState::New && state != PeerState::Punching {
            self.out_queue.set_drop_tail(false);
        }
    }

    /// Transitions to `Closed` and wakes anything waiting on `cond_connected`.
    pub fn close(&self) {
        {
            let mut guarded = self.guarded.lock();
            guarded.state = PeerState::Closed;
        }
        self.cond_connected.notify_all();
        self.read_fifo.write_zero_length();
        self.out_queue.write_zero_length();
    }

    pub fn real_addr(&self) -> Option<SocketAddrV4> {
        self.guarded.lock().real_addr
    }

    /// Sets `real_addr` if it isn't already set — per §9's "first
    /// non-empty endpoint registration wins" resolution of the open
    /// question on repeated updates.
    pub fn set_real_addr_if_unset(&self, addr: SocketAddrV4) {
        let mut guarded = self.guarded.lock();
        if guarded.real_addr.is_none() {
            guarded.real_addr = Some(addr);
        }
    }

    pub fn touch_activity(&self, now: Instant) {
        self.guarded.lock().last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.guarded.lock().last_activity
    }

    pub fn last_keepalive_sent(&self) -> Instant {
        self.guarded.lock().last_keepalive_sent
    }

    pub fn set_last_keepalive_sent(&self, now: Instant) {
        self.guarded.lock().last_keepalive_sent = now;
    }

    pub fn set_rdv_answer(&self, answer: RdvAnswer) {
        self.guarded.lock().rdv_answer = Some(answer);
        self.cond_connected.notify_all();
    }

    pub fn take_rdv_answer(&self) -> Option<RdvAnswer> {
        self.guarded.lock().rdv_answer.take()
    }

    /// Blocks up to `timeout` for `cond_connected` to fire (a single wait,
    /// matching the original's single `pthread_cond_timedwait` call — the
    /// peer's state never changes except under this same lock, so there is
    /// nothing to spin-check between wakeups).
    pub fn wait_signal(&self, timeout: Duration) {
        let mut guarded = self.guarded.lock();
        self.cond_connected.wait_for(&mut guarded, timeout);
    }

    pub fn signal_connected(&self) {
        self.cond_connected.notify_all();
    }
}

/// Indexed by VPN IP (always) and by real endpoint (once known, per
/// invariant ii in `spec.md` §3).
#[derive(Default)]
struct Indices {
    by_vpn: HashMap<Ipv4Addr, Arc<Peer>>,
    by_addr: HashMap<SocketAddrV4, Arc<Peer>>,
}

pub struct PeerTable {
    inner: Mutex<Indices>,
    max_clients: usize,
}

impl PeerTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: Mutex::new(Indices::default()),
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_vpn.len()
    }

    pub fn is_full(&self) -> bool {
        self.max_clients != 0 && self.len() >= self.max_clients
    }

    pub fn by_vpn_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<Peer>> {
        self.inner.lock().by_vpn.get(&vpn_ip).cloned()
    }

    pub fn by_real_addr(&self, addr: SocketAddrV4) -> Option<Arc<Peer>> {
        self.inner.lock().by_addr.get(&addr).cloned()
    }

    /// Inserts a freshly created peer, indexed by VPN IP only. Called by
    /// `TunIngress` (initiator, `New`) before a real endpoint is known.
    pub fn insert_by_vpn(&self, peer: Arc<Peer>) {
        self.inner.lock().by_vpn.insert(peer.vpn_ip, peer);
    }

    /// Inserts a freshly created responder peer, indexed by both VPN IP
    /// and its already-known real endpoint (from FWD_CONNECTION).
    pub fn insert_with_real_addr(&self, peer: Arc<Peer>, addr: SocketAddrV4) {
        peer.set_real_addr_if_unset(addr);
        let mut inner = self.inner.lock();
        inner.by_addr.insert(addr, peer.clone());
        inner.by_vpn.insert(peer.vpn_ip, peer);
    }

    /// Registers the real-endpoint index for a peer that was only
    /// indexed by VPN IP so far (initiator path, after ANS_CONNECTION).
    pub fn register_real_addr(&self, peer: &Arc<Peer>, addr: SocketAddrV4) {
        peer.set_real_addr_if_unset(addr);
        self.inner.lock().by_addr.insert(peer.real_addr().unwrap_or(addr), peer.clone());
    }

    /// Removes a peer from both indices. Safe to call more than once.
    pub fn remove(&self, vpn_ip: Ipv4Addr) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.by_vpn.remove(&vpn_ip) {
            if let Some(addr) = peer.real_addr() {
                inner.by_addr.remove(&addr);
            }
        }
    }

    /// All currently indexed peers, used for broadcast fan-out.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.inner.lock().by_vpn.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniqueness_by_vpn_ip_and_real_addr() {
        let table = PeerTable::new(0);
        let now = Instant::now();
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 2), true, PeerState::New, 8, now);
        table.insert_by_vpn(peer.clone());
        assert_eq!(table.len(), 1);

        let addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111);
        table.register_real_addr(&peer, addr);
        assert!(table.by_real_addr(addr).is_some());

        // A second registration attempt for a different address is a no-op
        // per the "first non-empty endpoint wins" resolution in spec.md §9.
        let other = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 2222);
        table.register_real_addr(&peer, other);
        assert_eq!(peer.real_addr(), Some(addr));
        assert!(table.by_real_addr(other).is_none());
    }

    #[test]
    fn remove_clears_both_indices_and_drops_last_strong_ref() {
        let table = PeerTable::new(0);
        let now = Instant::now();
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 2), true, PeerState::New, 8, now);
        let addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111);
        table.insert_with_real_addr(peer.clone(), addr);
        assert_eq!(Arc::strong_count(&peer), 3); // table(by_vpn) + table(by_addr) + local

        table.remove(peer.vpn_ip);
        assert!(table.by_vpn_ip(peer.vpn_ip).is_none());
        assert!(table.by_real_addr(addr).is_none());
        assert_eq!(Arc::strong_count(&peer), 1); // only the local handle remains
    }
}
