//! `SocketIngress`: the single thread draining the shared UDP socket,
//! per `spec.md` §4.6.

use std::net::SocketAddrV4;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use campagnol_proto::{looks_like_dtls, ControlMessage, MessageType, MESSAGE_LEN};

use crate::engine::ClientContext;
use crate::peer::PeerState;
use crate::wire::{self, DTLS_APPLICATION_DATA};

pub fn run(ctx: Arc<ClientContext>, rdv_tx: Sender<ControlMessage>) {
    let mut buf = [0u8; 2048];
    loop {
        let (n, from) = match ctx.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock || error.kind() == std::io::ErrorKind::TimedOut => {
                if ctx.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(error) => {
                tracing::warn!(%error, "socket recv failed, stopping SocketIngress");
                return;
            }
        };
        let from = match from {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => continue,
        };
        let datagram = &buf[..n];
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(%from, len = n, data = %hex::encode(datagram), "wire: inbound datagram");
        }

        if from == ctx.server_addr && n == MESSAGE_LEN {
            if let Ok(msg) = ControlMessage::decode(datagram) {
                let _ = rdv_tx.send(msg);
            }
            continue;
        }

        if looks_like_dtls(datagram[0]) {
            handle_dtls_record(&ctx, from, datagram);
            continue;
        }

        if n == MESSAGE_LEN {
            if let Ok(msg) = ControlMessage::decode(datagram) {
                handle_punch(&ctx, msg);
            }
        }
    }
}

fn handle_dtls_record(ctx: &ClientContext, from: SocketAddrV4, datagram: &[u8]) {
    let Some(peer) = ctx.table.by_real_addr(from) else {
        if datagram[0] == DTLS_APPLICATION_DATA {
            if let Some(alert) = wire::synthetic_fatal_alert(datagram) {
                send_control_raw(ctx, from, &alert);
            }
        }
        return;
    };
    match peer.state() {
        PeerState::Linked | PeerState::Established => {
            peer.read_fifo.write(datagram);
            peer.touch_activity(Instant::now());
        }
        _ => {}
    }
}

/// `PUNCH`/`PUNCH_KEEP_ALIVE` carry the sender's own VPN IP in `ip1`; the
/// peer to signal is looked up by that field, not by the UDP source
/// address (the original's `get_client_VPN(&rmsg->ip1)`).
fn handle_punch(ctx: &ClientContext, msg: ControlMessage) {
    if msg.ty != MessageType::Punch && msg.ty != MessageType::PunchKeepAlive {
        return;
    }
    let Some(peer) = ctx.table.by_vpn_ip(msg.ip1) else {
        return;
    };
    peer.touch_activity(Instant::now());
    peer.signal_connected();
}

fn send_control_raw(ctx: &ClientContext, to: SocketAddrV4, buf: &[u8]) {
    if let Err(error) = ctx.socket.send_to(buf, std::net::SocketAddr::V4(to)) {
        tracing::debug!(%error, %to, "failed to send synthetic DTLS alert");
    }
}
