mod checksum;
mod engine;
mod peer;
mod peer_sink;
mod rdv;
mod session;
mod socket_ingress;
mod tun_ingress;
mod wire;

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use campagnol_config::ClientConfig;
use campagnol_logging::Verbosity;
use campagnol_tun::{run_commands, Tun, TemplateVars};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};

const DEFAULT_CONFIG_PATH: &str = "/etc/campagnol/campagnol.conf";

#[derive(Parser, Debug)]
#[command(name = "campagnol", version, about = "Campagnol VPN client")]
struct Args {
    /// Config file path.
    config: Option<PathBuf>,

    /// Run as a daemon (log to the journal instead of stderr).
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Increase verbosity; twice to also dump every control message and packet.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// Requested TUN device name (e.g. "tun0").
    #[arg(short = 'i', long)]
    interface: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    campagnol_logging::init(Verbosity { verbose: args.verbose, debug: args.debug }, args.daemon);

    // Block the signals the dedicated handling thread below waits on;
    // every other worker thread inherits this mask (`spec.md` §5).
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGQUIT);
    mask.thread_block().context("blocking termination signals")?;

    let config_path = args.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = ClientConfig::from_file(&config_path).context("loading config file")?;
    if let Some(interface) = args.interface {
        config.interface = Some(interface);
    }

    let tun = open_tun(&config)?;
    let tun_name = tun.name().to_string();

    let ctx = engine::run(config, tun)?;
    wait_for_termination_signal(mask);
    engine::shutdown(&ctx);
    run_if_down(&ctx.config, &tun_name);
    Ok(())
}

fn run_if_down(config: &ClientConfig, tun_name: &str) {
    let Some(template) = &config.if_down else {
        return;
    };
    let vars = TemplateVars {
        device: tun_name.to_string(),
        vpn_ip: config.vpn_ip,
        mtu: config.tun_mtu,
        network: config.network.clone(),
        netmask: netmask_for(&config.network),
        local_port: config.local_port,
        local_ip: local_ip_for_template(config),
    };
    if let Err(error) = run_commands(template, &vars) {
        tracing::warn!(%error, "if_down commands failed");
    }
}

fn open_tun(config: &ClientConfig) -> Result<Tun> {
    let tun = Tun::open(config.interface.as_deref()).context("opening tun device")?;
    config.network().context("validating network")?; // vpn_ip must fall inside it
    let netmask = netmask_for(&config.network);

    if let Some(template) = &config.if_up {
        let vars = TemplateVars {
            device: tun.name().to_string(),
            vpn_ip: config.vpn_ip,
            mtu: config.tun_mtu,
            network: config.network.clone(),
            netmask,
            local_port: config.local_port,
            local_ip: local_ip_for_template(config),
        };
        run_commands(template, &vars).context("running if_up commands")?;
    }
    Ok(tun)
}

fn netmask_for(cidr: &str) -> Ipv4Addr {
    let prefix: u32 = cidr.split_once('/').and_then(|(_, p)| p.parse().ok()).unwrap_or(24);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ipv4Addr::from(mask)
}

fn local_ip_for_template(config: &ClientConfig) -> Ipv4Addr {
    match config.local_host {
        Some(std::net::IpAddr::V4(addr)) => addr,
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

/// Blocks this thread until one of the masked signals arrives. Worker
/// threads are background threads that don't outlive the process; once
/// this returns, `main` sends BYE and exits.
fn wait_for_termination_signal(mask: SigSet) {
    match mask.wait() {
        Ok(signal) => tracing::info!(?signal, "received termination signal, shutting down"),
        Err(error) => tracing::warn!(%error, "sigwait failed, shutting down anyway"),
    }
}
