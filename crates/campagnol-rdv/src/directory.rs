//! `PeerDirectory`: the RDV server's client table, keyed both by VPN IP
//! and by the real UDP endpoint a client is currently registered from.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

/// A record is timed out after this long without a HELLO/PING refresh.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);
/// A timed-out record is reaped once it has been stale for this long.
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub vpn_ip: Ipv4Addr,
    pub real_addr: SocketAddrV4,
    pub lan_hint: Option<SocketAddrV4>,
    pub last_activity: Instant,
}

impl PeerRecord {
    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > PEER_TIMEOUT
    }

    pub fn is_dead(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > DEAD_TIMEOUT
    }
}

/// Maps a VPN IP to its live client record and real endpoint, with a
/// secondary index for looking up "who is this datagram from".
#[derive(Default)]
pub struct PeerDirectory {
    by_vpn: HashMap<Ipv4Addr, PeerRecord>,
    by_addr: HashMap<SocketAddrV4, Ipv4Addr>,
    max_clients: usize,
}

impl PeerDirectory {
    pub fn new(max_clients: usize) -> Self {
        Self {
            by_vpn: HashMap::new(),
            by_addr: HashMap::new(),
            max_clients,
        }
    }

    pub fn len(&self) -> usize {
        self.by_vpn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vpn.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.max_clients != 0 && self.by_vpn.len() >= self.max_clients
    }

    pub fn by_vpn_ip(&self, vpn_ip: Ipv4Addr) -> Option<&PeerRecord> {
        self.by_vpn.get(&vpn_ip)
    }

    pub fn by_real_addr(&self, addr: SocketAddrV4) -> Option<&PeerRecord> {
        self.by_addr.get(&addr).and_then(|ip| self.by_vpn.get(ip))
    }

    /// Inserts or replaces the record for `vpn_ip`, updating both indices.
    /// Callers are responsible for evicting any prior record at a
    /// conflicting `real_addr` first.
    pub fn insert(&mut self, record: PeerRecord) {
        if let Some(prior) = self.by_vpn.get(&record.vpn_ip) {
            self.by_addr.remove(&prior.real_addr);
        }
        self.by_addr.insert(record.real_addr, record.vpn_ip);
        self.by_vpn.insert(record.vpn_ip, record);
    }

    pub fn refresh(&mut self, vpn_ip: Ipv4Addr, now: Instant) {
        if let Some(record) = self.by_vpn.get_mut(&vpn_ip) {
            record.last_activity = now;
        }
    }

    /// Removes the record for `vpn_ip`, if any, from both indices.
    pub fn remove(&mut self, vpn_ip: Ipv4Addr) -> Option<PeerRecord> {
        let record = self.by_vpn.remove(&vpn_ip)?;
        self.by_addr.remove(&record.real_addr);
        Some(record)
    }

    /// Removes every record dead as of `now`, returning their VPN IPs so
    /// the caller can also purge any sessions referencing them.
    pub fn reap_dead(&mut self, now: Instant) -> Vec<Ipv4Addr> {
        let dead: Vec<Ipv4Addr> = self
            .by_vpn
            .values()
            .filter(|r| r.is_dead(now))
            .map(|r| r.vpn_ip)
            .collect();
        for vpn_ip in &dead {
            self.remove(*vpn_ip);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(vpn_ip: [u8; 4], addr: (u8, u8, u8, u8, u16), now: Instant) -> PeerRecord {
        PeerRecord {
            vpn_ip: Ipv4Addr::from(vpn_ip),
            real_addr: SocketAddrV4::new(Ipv4Addr::new(addr.0, addr.1, addr.2, addr.3), addr.4),
            lan_hint: None,
            last_activity: now,
        }
    }

    #[test]
    fn insert_then_lookup_by_both_indices() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new(0);
        dir.insert(rec([10, 0, 0, 2], (203, 0, 113, 7, 1111), now));
        assert!(dir.by_vpn_ip(Ipv4Addr::new(10, 0, 0, 2)).is_some());
        assert!(dir
            .by_real_addr(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111))
            .is_some());
    }

    #[test]
    fn insert_replaces_prior_real_addr_index_entry() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new(0);
        dir.insert(rec([10, 0, 0, 2], (203, 0, 113, 7, 1111), now));
        dir.insert(rec([10, 0, 0, 2], (203, 0, 113, 7, 2222), now));
        assert!(dir
            .by_real_addr(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111))
            .is_none());
        assert!(dir
            .by_real_addr(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 2222))
            .is_some());
    }

    #[test]
    fn full_directory_rejects_new_entries_until_reaped() {
        let now = Instant::now();
        let mut dir = PeerDirectory::new(1);
        dir.insert(rec([10, 0, 0, 2], (203, 0, 113, 7, 1111), now));
        assert!(dir.is_full());
        let dead_time = now + DEAD_TIMEOUT + Duration::from_secs(1);
        assert_eq!(dir.reap_dead(dead_time), vec![Ipv4Addr::new(10, 0, 0, 2)]);
        assert!(!dir.is_full());
    }
}
