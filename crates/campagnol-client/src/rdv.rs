//! Registration with, and the ongoing control channel to, the RDV server.
//!
//! `register_rdv` implements the original's `register_rdv` HELLO loop.
//! `RdvDispatcher` is the long-lived thread that owns every reply the
//! server sends after registration — ANS/REJ/FWD/RECONNECT/PONG — and
//! mutates peer/table state directly, mirroring `comm_socket`'s handling
//! of the same message types in the original.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use campagnol_proto::{ControlMessage, MessageType};

use crate::engine::ClientContext;
use crate::peer::{Peer, PeerState, RdvAnswer};
use crate::session;
use crate::wire::send_control;

/// Number of HELLO attempts before registration is declared fatal,
/// matching the original's `MAX_REGISTERING_TRIES`.
pub const MAX_REGISTERING_TRIES: u32 = 4;

/// How long each HELLO attempt waits for a reply before it's retried.
const REGISTER_RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum RegisterOutcome {
    Registered,
    Rejected,
}

/// Sends HELLO up to `MAX_REGISTERING_TRIES` times, classifying each reply
/// as OK (done), NOK (sleep 1s, retry) or anything else ("strange", log
/// and retry). `rx` is the shared channel `SocketIngress` pushes every
/// RDV-originated control datagram onto.
pub fn register_rdv(ctx: &ClientContext, rx: &Receiver<ControlMessage>) -> RegisterOutcome {
    let lan_hint = if ctx.config.use_local_addr {
        ctx.local_addr.unwrap_or(Ipv4Addr::UNSPECIFIED)
    } else {
        Ipv4Addr::UNSPECIFIED
    };
    let hello = ControlMessage::new(MessageType::Hello, ctx.config.vpn_ip, lan_hint)
        .with_port(ctx.local_addr_port());

    for attempt in 1..=MAX_REGISTERING_TRIES {
        tracing::debug!(attempt, "sending HELLO to RDV server");
        send_control(&ctx.socket, ctx.server_addr, hello);

        match rx.recv_timeout(REGISTER_RECV_TIMEOUT) {
            Ok(msg) if msg.ty == MessageType::Ok => {
                tracing::info!("registered with RDV server");
                return RegisterOutcome::Registered;
            }
            Ok(msg) if msg.ty == MessageType::Nok => {
                tracing::warn!(attempt, "RDV server rejected registration, retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
            Ok(msg) => {
                tracing::warn!(attempt, ty = ?msg.ty, "unexpected reply while registering, retrying");
            }
            Err(_) => {
                tracing::warn!(attempt, "no reply from RDV server within timeout, retrying");
            }
        }
    }

    tracing::error!("exhausted registration attempts");
    RegisterOutcome::Rejected
}

/// `spec.md` §5: this dispatcher blocks with the same 2 s select-delay as
/// `SocketIngress`/`TunIngress` so it can observe `shutting_down` in bounded
/// time instead of parking in `rx.recv()` forever.
const SELECT_DELAY: Duration = Duration::from_secs(2);

/// The long-lived consumer of every control datagram the RDV server sends
/// after registration completes. Runs until `end_campagnol`-equivalent
/// shutdown is requested or the sending half is dropped.
pub fn run(ctx: Arc<ClientContext>, rx: Receiver<ControlMessage>) {
    loop {
        let msg = match rx.recv_timeout(SELECT_DELAY) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                if ctx.shutting_down.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let now = Instant::now();
        match msg.ty {
            MessageType::RejConnection => handle_rej(&ctx, msg),
            MessageType::AnsConnection => handle_ans(&ctx, msg),
            MessageType::FwdConnection => handle_fwd(&ctx, msg, now),
            MessageType::Reconnect => handle_reconnect(&ctx, &rx),
            MessageType::Pong => tracing::trace!("PONG from RDV server"),
            other => tracing::debug!(ty = ?other, "ignoring unexpected message on RDV channel"),
        }
    }
}

fn handle_rej(ctx: &ClientContext, msg: ControlMessage) {
    let Some(peer) = ctx.table.by_vpn_ip(msg.ip1) else {
        return;
    };
    tracing::info!(vpn_ip = %peer.vpn_ip, "RDV server rejected the connection request");
    peer.set_rdv_answer(RdvAnswer::Rej);
}

fn handle_ans(ctx: &ClientContext, msg: ControlMessage) {
    let Some(peer) = ctx.table.by_vpn_ip(msg.ip2) else {
        tracing::debug!(vpn_ip = %msg.ip2, "ANS_CONNECTION for unknown peer");
        return;
    };
    let real_addr = SocketAddrV4::new(msg.ip1, msg.port);
    ctx.table.register_real_addr(&peer, real_addr);
    peer.set_rdv_answer(RdvAnswer::Ans(real_addr));
}

fn handle_fwd(ctx: &Arc<ClientContext>, msg: ControlMessage, now: Instant) {
    let vpn_ip = msg.ip2;
    if ctx.table.by_vpn_ip(vpn_ip).is_some() {
        tracing::debug!(%vpn_ip, "FWD_CONNECTION for an already-known peer, ignoring");
        return;
    }
    if ctx.table.is_full() {
        tracing::warn!(%vpn_ip, "dropping FWD_CONNECTION, peer table is full");
        return;
    }
    let real_addr = SocketAddrV4::new(msg.ip1, msg.port);
    let peer = Peer::new(vpn_ip, false, PeerState::Punching, ctx.config.fifo_size, now);
    ctx.table.insert_with_real_addr(peer.clone(), real_addr);
    tracing::info!(%vpn_ip, %real_addr, "accepted FWD_CONNECTION, starting responder session");
    session::spawn(ctx.clone(), peer);
}

fn handle_reconnect(ctx: &ClientContext, rx: &Receiver<ControlMessage>) {
    tracing::warn!("RDV server asked us to re-register");
    register_rdv(ctx, rx);
}
