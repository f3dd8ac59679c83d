//! `TunIngress`: reads L3 packets off the TUN device and routes them to a
//! peer's `out_queue`, per `spec.md` §4.8.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::ClientContext;
use crate::peer::{Peer, PeerState};
use crate::session;

/// `spec.md` §5: `TunIngress` blocks in select with a 2 s timeout so it
/// can periodically observe `ClientContext::shutting_down`.
const SELECT_DELAY: Duration = Duration::from_secs(2);

pub fn run(ctx: Arc<ClientContext>) {
    let mut buf = vec![0u8; ctx.tun_mtu_with_overhead()];
    loop {
        if ctx.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let readable = match ctx.tun.lock().poll_readable(SELECT_DELAY) {
            Ok(readable) => readable,
            Err(error) => {
                tracing::warn!(%error, "tun poll failed, stopping TunIngress");
                return;
            }
        };
        if !readable {
            continue;
        }

        let n = {
            let mut tun = ctx.tun.lock();
            match tun.read_packet(&mut buf) {
                Ok(n) => n,
                Err(error) => {
                    tracing::warn!(%error, "tun read failed, stopping TunIngress");
                    return;
                }
            }
        };
        if n < 20 {
            continue;
        }
        let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

        if dst == ctx.vpn_broadcast_ip {
            for peer in ctx.table.all() {
                if peer.state() == PeerState::Established {
                    peer.out_queue.write(&buf[..n]);
                }
            }
            continue;
        }

        if dst == ctx.config.vpn_ip {
            let mut tun = ctx.tun.lock();
            if let Err(error) = tun.write_packet(&buf[..n]) {
                tracing::warn!(%error, "failed to loop back self-addressed packet");
            }
            continue;
        }

        let peer = match ctx.table.by_vpn_ip(dst) {
            Some(peer) => {
                if peer.state() == PeerState::Closed {
                    continue;
                }
                peer.touch_activity(Instant::now());
                peer
            }
            None => match start_initiator_peer(&ctx, dst) {
                Some(peer) => peer,
                None => continue,
            },
        };
        peer.out_queue.write(&buf[..n]);
    }
}

fn start_initiator_peer(ctx: &Arc<ClientContext>, dst: Ipv4Addr) -> Option<Arc<Peer>> {
    if ctx.table.is_full() {
        tracing::warn!(%dst, "dropping packet, peer table is full");
        return None;
    }
    let peer = Peer::new(dst, true, PeerState::New, ctx.config.fifo_size, Instant::now());
    ctx.table.insert_by_vpn(peer.clone());
    session::spawn(ctx.clone(), peer.clone());
    Some(peer)
}
