//! `ClientContext`: everything a peer session, `SocketIngress`,
//! `TunIngress` and `RdvDispatcher` all need a handle to, plus the
//! top-level thread wiring described in `spec.md` §5.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use campagnol_config::ClientConfig;
use campagnol_dtls::DTLS_RECORD_OVERHEAD;
use campagnol_proto::{ControlMessage, MessageType};
use campagnol_ratelimit::TokenBucket;
use campagnol_tun::Tun;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Socket, Type};

use crate::peer::PeerTable;
use crate::rdv;
use crate::socket_ingress;
use crate::tun_ingress;
use crate::wire::send_control;

/// `spec.md` §4.3: PING fires roughly every 10 s once registered.
const PING_INTERVAL: Duration = Duration::from_secs(10);

pub struct ClientContext {
    pub socket: Arc<UdpSocket>,
    pub server_addr: SocketAddrV4,
    pub table: Arc<PeerTable>,
    pub tun: Mutex<Tun>,
    pub config: ClientConfig,
    pub vpn_broadcast_ip: Ipv4Addr,
    /// The address this process advertises as its LAN hint, when
    /// `use_local_addr` is set. `None` when the operator hasn't
    /// configured `local_host` explicitly — this build favors an
    /// explicit value over auto-discovery (see `DESIGN.md`).
    pub local_addr: Option<Ipv4Addr>,
    pub client_wide_bucket: Option<Arc<TokenBucket>>,
    /// The Rust equivalent of the original's `end_campagnol` sticky flag
    /// (`spec.md` §5): every long-lived worker loop checks this at its
    /// suspension point and exits at the next wakeup once it is set.
    pub shutting_down: AtomicBool,
    /// Join handles for the process-lifetime worker threads (`SocketIngress`,
    /// `TunIngress`, `RdvDispatcher`, the PING timer). Per-peer session
    /// threads are intentionally not tracked here — they are unbounded in
    /// number over a long-running client's lifetime, and unblock and exit
    /// on their own once `shutdown` below has closed every table entry (see
    /// `shutdown`'s doc comment).
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientContext {
    pub fn local_addr_port(&self) -> u16 {
        self.config.local_port
    }

    pub fn tun_mtu_with_overhead(&self) -> usize {
        self.config.tun_mtu as usize + DTLS_RECORD_OVERHEAD
    }
}

fn client_wide_bucket(config: &ClientConfig) -> Option<Arc<TokenBucket>> {
    if config.client_max_rate <= 0.0 {
        None
    } else {
        Some(Arc::new(TokenBucket::new(
            (config.client_max_rate * 1000.0) as usize,
            config.client_max_rate,
            28, // IP + UDP header overhead charged per datagram
        )))
    }
}

/// Builds the shared context and spawns every long-lived worker thread.
/// Blocks the calling thread until registration with the RDV server
/// either succeeds or exhausts its retry budget, then hands the context
/// back so the caller can drive a graceful shutdown later.
pub fn run(mut config: ClientConfig, tun: Tun) -> anyhow::Result<Arc<ClientContext>> {
    let bind_ip = config.local_host.unwrap_or(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let socket = bind_client_socket(SocketAddr::new(bind_ip, config.local_port))?;
    let local_port = socket.local_addr()?.port();

    let server_ip: Ipv4Addr = resolve_server_host(&config.server_host)?;
    let server_addr = SocketAddrV4::new(server_ip, config.server_port);

    let local_addr = match config.local_host {
        Some(std::net::IpAddr::V4(addr)) if config.use_local_addr => Some(addr),
        _ => None,
    };

    let vpn_broadcast_ip = config.vpn_broadcast_ip()?;
    config.local_port = local_port;

    let ctx = Arc::new(ClientContext {
        socket: Arc::new(socket),
        server_addr,
        table: Arc::new(PeerTable::new(config.max_clients)),
        tun: Mutex::new(tun),
        client_wide_bucket: client_wide_bucket(&config),
        local_addr,
        vpn_broadcast_ip,
        config,
        shutting_down: AtomicBool::new(false),
        workers: Mutex::new(Vec::new()),
    });

    let (rdv_tx, rdv_rx) = mpsc::channel::<ControlMessage>();

    match rdv::register_rdv(&ctx, &rdv_rx) {
        rdv::RegisterOutcome::Registered => {}
        rdv::RegisterOutcome::Rejected => {
            anyhow::bail!("failed to register with RDV server {server_addr}");
        }
    }

    let mut workers = Vec::with_capacity(4);
    {
        let ctx = ctx.clone();
        let ingress_tx = rdv_tx.clone();
        workers.push(std::thread::spawn(move || socket_ingress::run(ctx, ingress_tx)));
    }
    {
        let ctx = ctx.clone();
        workers.push(std::thread::spawn(move || tun_ingress::run(ctx)));
    }
    {
        let ctx = ctx.clone();
        workers.push(std::thread::spawn(move || rdv::run(ctx, rdv_rx)));
    }
    workers.push(spawn_ping_timer(ctx.clone()));
    *ctx.workers.lock() = workers;

    Ok(ctx)
}

/// Sends BYE to the RDV server, closes every currently known peer (forcing
/// its session thread through DTLS shutdown and out of its blocking reads —
/// `spec.md` §5's "per-peer teardown ... posting a zero-length FIFO write"),
/// then joins the process-lifetime worker threads. Per-peer session threads
/// are left detached: each one observes `Peer::close`'s effects (the
/// `Closed` state, the zero-length FIFO wakeup) at its next suspension
/// point and exits well within the `SELECT_DELAY_SEC + peer.timeout + 5s`
/// bound `spec.md` §8 requires, so the process can exit without joining
/// them individually.
pub fn shutdown(ctx: &Arc<ClientContext>) {
    ctx.shutting_down.store(true, Ordering::SeqCst);
    send_control(
        &ctx.socket,
        ctx.server_addr,
        ControlMessage::new(MessageType::Bye, ctx.config.vpn_ip, Ipv4Addr::UNSPECIFIED),
    );
    for peer in ctx.table.all() {
        peer.close();
    }
    for handle in ctx.workers.lock().drain(..) {
        if let Err(error) = handle.join() {
            tracing::warn!(?error, "a worker thread panicked during shutdown");
        }
    }
}

/// Jitter applied to each PING interval so that a fleet of clients started
/// at the same moment (e.g. by the same orchestration tool) doesn't settle
/// into sending every PING in lockstep at the RDV server.
const PING_JITTER: Duration = Duration::from_millis(500);

/// How often the timer wakes to check `shutting_down` while waiting out
/// the rest of its `PING_INTERVAL`, matching the other workers' 2 s select
/// delay rather than sleeping the whole interval in one shot.
const PING_CHECK_INTERVAL: Duration = Duration::from_secs(2);

fn spawn_ping_timer(ctx: Arc<ClientContext>) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        let jitter = rand::thread_rng().gen_range(0..=PING_JITTER.as_millis() as u64);
        let mut remaining = PING_INTERVAL + Duration::from_millis(jitter);
        while remaining > Duration::ZERO {
            if ctx.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            let nap = remaining.min(PING_CHECK_INTERVAL);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
        if ctx.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        send_control(
            &ctx.socket,
            ctx.server_addr,
            ControlMessage::new(MessageType::Ping, ctx.config.vpn_ip, Ipv4Addr::UNSPECIFIED),
        );
    });
}

/// Every peer's DTLS records and every RDV control message share this one
/// socket (`spec.md` §5), so a busy client fanning out to many peers wants
/// more receive buffer than the OS default gives a freshly bound socket.
/// `SO_REUSEADDR` lets a quick client restart rebind the same port before
/// the OS has fully released it.
const REQUESTED_RECV_BUFFER_SIZE: usize = 1 << 20;

fn bind_client_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    if let Err(error) = socket.set_recv_buffer_size(REQUESTED_RECV_BUFFER_SIZE) {
        tracing::debug!(%error, "could not raise UDP receive buffer size");
    }
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(Duration::from_secs(2)))?;
    Ok(socket.into())
}

fn resolve_server_host(host: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    use std::net::ToSocketAddrs;
    (host, 0u16)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow::anyhow!("could not resolve server_host {host:?} to an IPv4 address"))
}
