//! `MessageDispatcher`: decodes one control datagram, mutates the
//! directory/session state, and returns the replies to send. Kept
//! sans-IO — it never touches a socket itself, only produces
//! [`Transmit`]s for the caller to send — so the whole state machine can
//! be driven from tests without binding a port.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use campagnol_proto::{ControlMessage, MessageType, MESSAGE_LEN};

use crate::directory::{PeerDirectory, PeerRecord};
use crate::sessions::SessionTable;

/// One outbound control datagram produced by handling an inbound one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddrV4,
    pub message: ControlMessage,
}

fn transmit(to: SocketAddrV4, message: ControlMessage) -> Transmit {
    Transmit { to, message }
}

pub struct MessageDispatcher {
    directory: PeerDirectory,
    sessions: SessionTable,
}

impl MessageDispatcher {
    pub fn new(max_clients: usize) -> Self {
        Self {
            directory: PeerDirectory::new(max_clients),
            sessions: SessionTable::new(),
        }
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Periodic sweep, called at least every 5s per `spec.md` §4.2.
    pub fn reap(&mut self, now: Instant) {
        for vpn_ip in self.directory.reap_dead(now) {
            self.sessions.remove_all_involving(vpn_ip);
        }
    }

    /// Handles one inbound datagram. Invalid-length datagrams are
    /// silently dropped, matching §4.2's failure semantics.
    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddrV4, now: Instant) -> Vec<Transmit> {
        if buf.len() != MESSAGE_LEN {
            return Vec::new();
        }
        let Ok(msg) = ControlMessage::decode(buf) else {
            return Vec::new();
        };

        let known = self.directory.by_real_addr(from).is_some();
        if !known && msg.ty != MessageType::Hello {
            return vec![transmit(from, reply(MessageType::Reconnect))];
        }

        match msg.ty {
            MessageType::Hello => self.handle_hello(msg, from, now),
            MessageType::Bye => {
                self.handle_bye(from);
                Vec::new()
            }
            MessageType::Ping => self.handle_ping(from, now),
            MessageType::AskConnection => self.handle_ask(msg, from, now),
            MessageType::CloseConnection => {
                self.handle_close(msg, from);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_hello(&mut self, msg: ControlMessage, from: SocketAddrV4, now: Instant) -> Vec<Transmit> {
        let vpn_ip = msg.ip1;
        let lan_hint = lan_hint_from(&msg, from);

        match self.directory.by_real_addr(from).cloned() {
            None => {
                if let Some(existing) = self.directory.by_vpn_ip(vpn_ip).cloned() {
                    if existing.is_timed_out(now) {
                        self.evict(existing.vpn_ip);
                    } else {
                        return vec![transmit(from, reply(MessageType::Nok))];
                    }
                }

                if self.directory.is_full() {
                    self.reap(now);
                    if self.directory.is_full() {
                        return vec![transmit(from, reply(MessageType::Nok))];
                    }
                }

                self.directory.insert(PeerRecord {
                    vpn_ip,
                    real_addr: from,
                    lan_hint,
                    last_activity: now,
                });
                vec![transmit(from, reply(MessageType::Ok))]
            }
            Some(existing) if existing.is_timed_out(now) => {
                if existing.vpn_ip == vpn_ip {
                    self.directory.refresh(vpn_ip, now);
                    vec![transmit(from, reply(MessageType::Ok))]
                } else {
                    self.evict(existing.vpn_ip);
                    self.directory.insert(PeerRecord {
                        vpn_ip,
                        real_addr: from,
                        lan_hint,
                        last_activity: now,
                    });
                    vec![transmit(from, reply(MessageType::Ok))]
                }
            }
            Some(_) => vec![transmit(from, reply(MessageType::Nok))],
        }
    }

    fn handle_bye(&mut self, from: SocketAddrV4) {
        if let Some(record) = self.directory.by_real_addr(from) {
            self.evict(record.vpn_ip);
        }
    }

    fn handle_ping(&mut self, from: SocketAddrV4, now: Instant) -> Vec<Transmit> {
        if let Some(record) = self.directory.by_real_addr(from) {
            self.directory.refresh(record.vpn_ip, now);
        }
        vec![transmit(from, reply(MessageType::Pong))]
    }

    fn handle_ask(&mut self, msg: ControlMessage, from: SocketAddrV4, now: Instant) -> Vec<Transmit> {
        let Some(asker) = self.directory.by_real_addr(from).cloned() else {
            return Vec::new();
        };
        let target_vpn_ip = msg.ip1;

        let Some(target) = self.directory.by_vpn_ip(target_vpn_ip).cloned() else {
            return vec![transmit(from, ControlMessage::new(MessageType::RejConnection, target_vpn_ip, Ipv4Addr::UNSPECIFIED))];
        };

        if target.is_timed_out(now) {
            self.evict(target.vpn_ip);
            return vec![transmit(from, ControlMessage::new(MessageType::RejConnection, target_vpn_ip, Ipv4Addr::UNSPECIFIED))];
        }

        let send_local = asker.lan_hint.is_some()
            && target.lan_hint.is_some()
            && asker.real_addr.ip() == target.real_addr.ip();

        let existing = self.sessions.get(asker.vpn_ip, target.vpn_ip);
        if existing.is_none() {
            self.sessions.remove(target.vpn_ip, asker.vpn_ip);
            self.sessions.insert(asker.vpn_ip, target.vpn_ip, now);
        } else {
            self.sessions.insert(asker.vpn_ip, target.vpn_ip, now);
        }

        let mut out = Vec::with_capacity(2);
        out.push(transmit(asker.real_addr, ans_message(&target, send_local)));
        out.push(transmit(target.real_addr, fwd_message(&asker, send_local)));
        out
    }

    fn handle_close(&mut self, msg: ControlMessage, from: SocketAddrV4) {
        let Some(asker) = self.directory.by_real_addr(from).cloned() else {
            return;
        };
        let other_vpn_ip = msg.ip1;
        self.sessions.remove(asker.vpn_ip, other_vpn_ip);
        self.sessions.remove(other_vpn_ip, asker.vpn_ip);
    }

    fn evict(&mut self, vpn_ip: Ipv4Addr) {
        self.directory.remove(vpn_ip);
        self.sessions.remove_all_involving(vpn_ip);
    }
}

fn reply(ty: MessageType) -> ControlMessage {
    ControlMessage::new(ty, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
}

fn lan_hint_from(msg: &ControlMessage, _from: SocketAddrV4) -> Option<SocketAddrV4> {
    if msg.port == 0 {
        None
    } else {
        Some(SocketAddrV4::new(msg.ip2, msg.port))
    }
}

fn ans_message(target: &PeerRecord, send_local: bool) -> ControlMessage {
    let endpoint = if send_local { target.lan_hint.unwrap() } else { target.real_addr };
    ControlMessage::new(MessageType::AnsConnection, *endpoint.ip(), target.vpn_ip).with_port(endpoint.port())
}

fn fwd_message(asker: &PeerRecord, send_local: bool) -> ControlMessage {
    let endpoint = if send_local { asker.lan_hint.unwrap() } else { asker.real_addr };
    ControlMessage::new(MessageType::FwdConnection, *endpoint.ip(), asker.vpn_ip).with_port(endpoint.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hello(vpn_ip: Ipv4Addr, lan: Option<(Ipv4Addr, u16)>) -> [u8; MESSAGE_LEN] {
        let msg = match lan {
            Some((ip, port)) => ControlMessage::new(MessageType::Hello, vpn_ip, ip).with_port(port),
            None => ControlMessage::new(MessageType::Hello, vpn_ip, Ipv4Addr::UNSPECIFIED),
        };
        msg.encode()
    }

    #[test]
    fn registration_success_then_duplicate_hello_rejected() {
        let now = Instant::now();
        let mut dispatcher = MessageDispatcher::new(0);
        let from = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111);
        let encoded = hello(Ipv4Addr::new(10, 0, 0, 2), Some((Ipv4Addr::new(192, 168, 1, 5), 30000)));

        let out = dispatcher.handle_datagram(&encoded, from, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.ty, MessageType::Ok);
        assert_eq!(dispatcher.directory().len(), 1);

        let out2 = dispatcher.handle_datagram(&encoded, from, now + Duration::from_secs(1));
        assert_eq!(out2[0].message.ty, MessageType::Nok);
    }

    #[test]
    fn timed_out_re_hello_from_new_endpoint_evicts_and_replaces() {
        let t0 = Instant::now();
        let mut dispatcher = MessageDispatcher::new(0);
        let old_from = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111);
        let encoded = hello(Ipv4Addr::new(10, 0, 0, 2), None);
        dispatcher.handle_datagram(&encoded, old_from, t0);

        let new_from = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 8), 2222);
        let t1 = t0 + Duration::from_secs(11);
        let out = dispatcher.handle_datagram(&encoded, new_from, t1);
        assert_eq!(out[0].message.ty, MessageType::Ok);
        assert!(dispatcher.directory().by_real_addr(old_from).is_none());
        assert!(dispatcher.directory().by_real_addr(new_from).is_some());
    }

    #[test]
    fn brokering_with_matching_lan_hints_uses_private_endpoints() {
        let now = Instant::now();
        let mut dispatcher = MessageDispatcher::new(0);
        let a_addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1111);
        let b_addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 2222);
        dispatcher.handle_datagram(
            &hello(Ipv4Addr::new(10, 0, 0, 2), Some((Ipv4Addr::new(192, 168, 1, 5), 30000))),
            a_addr,
            now,
        );
        dispatcher.handle_datagram(
            &hello(Ipv4Addr::new(10, 0, 0, 3), Some((Ipv4Addr::new(192, 168, 1, 6), 30001))),
            b_addr,
            now,
        );

        let ask = ControlMessage::new(MessageType::AskConnection, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode();
        let out = dispatcher.handle_datagram(&ask, a_addr, now);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, a_addr);
        assert_eq!(out[0].message.ty, MessageType::AnsConnection);
        assert_eq!(out[0].message.ip1, Ipv4Addr::new(192, 168, 1, 6));
        assert_eq!(out[0].message.port, 30001);
        assert_eq!(out[1].to, b_addr);
        assert_eq!(out[1].message.ty, MessageType::FwdConnection);
        assert_eq!(out[1].message.ip1, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(out[1].message.port, 30000);
    }

    #[test]
    fn unknown_sender_gets_reconnect_unless_hello() {
        let now = Instant::now();
        let mut dispatcher = MessageDispatcher::new(0);
        let from = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 3333);
        let ping = ControlMessage::new(MessageType::Ping, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED).encode();
        let out = dispatcher.handle_datagram(&ping, from, now);
        assert_eq!(out[0].message.ty, MessageType::Reconnect);
    }
}
