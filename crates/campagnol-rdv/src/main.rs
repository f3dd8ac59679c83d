use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use campagnol_config::ServerConfig;
use campagnol_logging::Verbosity;
use campagnol_proto::MESSAGE_LEN;
use campagnol_rdv::MessageDispatcher;
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing::Level;

/// How often the reaper sweep runs at minimum, per `spec.md` §4.2.
const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Socket read timeout standing in for the original's `select()` delay.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "campagnol-rdv", version, about = "Campagnol rendezvous server")]
struct Args {
    /// Config file path.
    config: Option<PathBuf>,

    /// Run as a daemon (log to the journal instead of stderr).
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Increase verbosity; twice to also dump every control message.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// Maximum number of registered clients (0 = unlimited).
    #[arg(short = 'm', long = "max-clients")]
    max_clients: Option<usize>,

    /// Pidfile path.
    #[arg(short = 'P', long)]
    pidfile: Option<PathBuf>,

    /// UDP port to bind.
    #[arg(short = 'p', long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    campagnol_logging::init(Verbosity { verbose: args.verbose, debug: args.debug }, args.daemon);

    // Block the signals the dedicated handling thread below waits on;
    // the main thread stays busy in the dispatch loop, so it polls
    // `shutting_down` instead of waiting on them itself (`spec.md` §6).
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGQUIT);
    mask.thread_block().context("blocking termination signals")?;
    let shutting_down = Arc::new(AtomicBool::new(false));
    spawn_signal_thread(mask, shutting_down.clone());

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path).context("loading config file")?,
        None => ServerConfig::default(),
    };
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(pidfile) = args.pidfile {
        config.pidfile = Some(pidfile);
    }

    if let Some(pidfile) = &config.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id())).context("writing pidfile")?;
    }

    let bind_ip = config.bind_host.unwrap_or(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let socket = UdpSocket::bind((bind_ip, config.port)).context("binding UDP socket")?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    tracing::info!(port = config.port, max_clients = config.max_clients, "campagnol-rdv listening");

    let mut dispatcher = MessageDispatcher::new(config.max_clients);
    let mut last_reap = Instant::now();
    let mut buf = [0u8; 512];

    while !shutting_down.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, std::net::SocketAddr::V4(from))) => {
                if len > MESSAGE_LEN && tracing::enabled!(Level::TRACE) {
                    tracing::trace!(%from, bytes = hex::encode(&buf[..len]), "oversized datagram dropped");
                }
                let now = Instant::now();
                for transmit in dispatcher.handle_datagram(&buf[..len], from, now) {
                    if tracing::enabled!(Level::TRACE) {
                        tracing::trace!(to = %transmit.to, ty = ?transmit.message.ty, "sending control message");
                    }
                    if let Err(error) = socket.send_to(&transmit.message.encode(), transmit.to) {
                        tracing::warn!(%error, to = %transmit.to, "failed to send reply");
                    }
                }
            }
            Ok((_, std::net::SocketAddr::V6(_))) => {}
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(error) => tracing::warn!(%error, "recvfrom failed"),
        }

        if last_reap.elapsed() >= REAP_INTERVAL {
            let now = Instant::now();
            dispatcher.reap(now);
            last_reap = now;
        }
    }

    if let Some(pidfile) = &config.pidfile {
        if let Err(error) = std::fs::remove_file(pidfile) {
            tracing::warn!(%error, "failed to remove pidfile");
        }
    }
    Ok(())
}

/// Waits on `mask` from a dedicated thread since the main thread is busy
/// in the dispatch loop; sets `shutting_down` so that loop notices on its
/// next `RECV_TIMEOUT` tick instead of blocking forever on `sigwait`.
fn spawn_signal_thread(mask: SigSet, shutting_down: Arc<AtomicBool>) {
    std::thread::spawn(move || match mask.wait() {
        Ok(signal) => {
            tracing::info!(?signal, "received termination signal, shutting down");
            shutting_down.store(true, Ordering::Relaxed);
        }
        Err(error) => {
            tracing::warn!(%error, "sigwait failed, shutting down anyway");
            shutting_down.store(true, Ordering::Relaxed);
        }
    });
}
