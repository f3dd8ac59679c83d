//! End-to-end scenarios from `spec.md` §8, driven directly against
//! `MessageDispatcher` without a socket.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use campagnol_proto::{ControlMessage, MessageType};
use campagnol_rdv::MessageDispatcher;

fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
}

#[test]
fn scenario_1_registration_success_and_directory_size() {
    let mut dispatcher = MessageDispatcher::new(0);
    let now = Instant::now();
    let from = addr(203, 0, 113, 7, 1111);
    let hello = ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 5))
        .with_port(30000)
        .encode();

    let out = dispatcher.handle_datagram(&hello, from, now);
    assert_eq!(out[0].message.ty, MessageType::Ok);
    assert_eq!(dispatcher.directory().len(), 1);

    let repeat = dispatcher.handle_datagram(&hello, from, now + Duration::from_secs(1));
    assert_eq!(repeat[0].message.ty, MessageType::Nok);
}

#[test]
fn scenario_3_brokering_falls_back_to_public_endpoints_on_different_public_ips() {
    let mut dispatcher = MessageDispatcher::new(0);
    let now = Instant::now();
    let a_addr = addr(203, 0, 113, 7, 1111);
    let b_addr = addr(198, 51, 100, 9, 2222);

    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(192, 168, 1, 5))
            .with_port(30000)
            .encode(),
        a_addr,
        now,
    );
    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(192, 168, 1, 6))
            .with_port(30001)
            .encode(),
        b_addr,
        now,
    );

    let ask = ControlMessage::new(MessageType::AskConnection, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode();
    let out = dispatcher.handle_datagram(&ask, a_addr, now);
    assert_eq!(out[0].message.ip1, *b_addr.ip());
    assert_eq!(out[0].message.port, b_addr.port());
    assert_eq!(out[1].message.ip1, *a_addr.ip());
    assert_eq!(out[1].message.port, a_addr.port());
}

#[test]
fn repeated_ask_connection_refreshes_session_instead_of_duplicating() {
    let mut dispatcher = MessageDispatcher::new(0);
    let now = Instant::now();
    let a_addr = addr(203, 0, 113, 7, 1111);
    let b_addr = addr(203, 0, 113, 8, 2222);

    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::UNSPECIFIED).encode(),
        a_addr,
        now,
    );
    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode(),
        b_addr,
        now,
    );

    let ask = ControlMessage::new(MessageType::AskConnection, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode();
    dispatcher.handle_datagram(&ask, a_addr, now);
    assert_eq!(dispatcher.sessions().len(), 1);
    dispatcher.handle_datagram(&ask, a_addr, now + Duration::from_secs(1));
    assert_eq!(dispatcher.sessions().len(), 1);
}

#[test]
fn ask_connection_for_missing_target_is_rejected() {
    let mut dispatcher = MessageDispatcher::new(0);
    let now = Instant::now();
    let from = addr(203, 0, 113, 7, 1111);
    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::UNSPECIFIED).encode(),
        from,
        now,
    );

    let ask = ControlMessage::new(MessageType::AskConnection, Ipv4Addr::new(10, 0, 0, 99), Ipv4Addr::UNSPECIFIED).encode();
    let out = dispatcher.handle_datagram(&ask, from, now);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].message.ty, MessageType::RejConnection);
    assert_eq!(out[0].message.ip1, Ipv4Addr::new(10, 0, 0, 99));
}

#[test]
fn bye_removes_client_and_its_sessions() {
    let mut dispatcher = MessageDispatcher::new(0);
    let now = Instant::now();
    let a_addr = addr(203, 0, 113, 7, 1111);
    let b_addr = addr(203, 0, 113, 8, 2222);
    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::UNSPECIFIED).encode(),
        a_addr,
        now,
    );
    dispatcher.handle_datagram(
        &ControlMessage::new(MessageType::Hello, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode(),
        b_addr,
        now,
    );
    let ask = ControlMessage::new(MessageType::AskConnection, Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::UNSPECIFIED).encode();
    dispatcher.handle_datagram(&ask, a_addr, now);
    assert_eq!(dispatcher.sessions().len(), 1);

    let bye = ControlMessage::new(MessageType::Bye, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED).encode();
    dispatcher.handle_datagram(&bye, a_addr, now);
    assert_eq!(dispatcher.directory().len(), 1);
    assert_eq!(dispatcher.sessions().len(), 0);
}
