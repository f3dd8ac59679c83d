//! The point-to-point IPv4 tunnel device: open/read/write and the
//! up/down command templating described in `spec.md` §6. Device
//! setup/teardown proper (what `ifconfig`/`ip route` commands actually
//! configure) is left to whatever the operator puts in their up/down
//! command templates — this module only substitutes and executes them.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use subprocess::Exec;

#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("failed to open /dev/net/tun: {0}")]
    Open(io::Error),
    #[error("TUNSETIFF ioctl failed: {0}")]
    SetIff(io::Error),
    #[error("up/down command failed: {0}")]
    Command(#[from] subprocess::PopenError),
    #[error("up/down command exited with {0:?}")]
    CommandFailed(subprocess::ExitStatus),
    #[error("tun i/o error: {0}")]
    Io(#[from] io::Error),
}

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
/// `_IOW('T', 202, int)` from `linux/if_tun.h`.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Values substituted into up/down command templates, per `spec.md` §6:
/// `%D` device, `%V` VPN IP, `%M` MTU, `%N` subnet string, `%n` netmask IP,
/// `%P` local UDP port, `%I` local IP.
pub struct TemplateVars {
    pub device: String,
    pub vpn_ip: Ipv4Addr,
    pub mtu: u16,
    pub network: String,
    pub netmask: Ipv4Addr,
    pub local_port: u16,
    pub local_ip: Ipv4Addr,
}

impl TemplateVars {
    fn expand(&self, template: &str) -> String {
        template
            .replace("%D", &self.device)
            .replace("%V", &self.vpn_ip.to_string())
            .replace("%M", &self.mtu.to_string())
            .replace("%N", &self.network)
            .replace("%n", &self.netmask.to_string())
            .replace("%P", &self.local_port.to_string())
            .replace("%I", &self.local_ip.to_string())
    }
}

/// Run each `;`-separated command in `template_list` through a shell,
/// after substituting `%...` placeholders. Mirrors the original's
/// "run each command, keep going on failure, log the exit status" up/down
/// script semantics.
pub fn run_commands(template_list: &str, vars: &TemplateVars) -> Result<(), TunError> {
    for template in template_list.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let cmd = vars.expand(template);
        tracing::debug!(%cmd, "running tun up/down command");
        let status = Exec::shell(&cmd).join()?;
        if !status.success() {
            tracing::warn!(%cmd, ?status, "tun up/down command did not exit successfully");
        }
    }
    Ok(())
}

/// An open Linux TUN device: a point-to-point IPv4 interface with no
/// Ethernet framing (`IFF_TUN | IFF_NO_PI`).
pub struct Tun {
    file: File,
    name: String,
}

impl Tun {
    /// Opens `/dev/net/tun` and binds it to `requested_name` (or lets the
    /// kernel assign one, e.g. `tun%d`, when `None`).
    pub fn open(requested_name: Option<&str>) -> Result<Self, TunError> {
        let path = CString::new("/dev/net/tun").expect("no interior NUL");
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(TunError::Open(io::Error::last_os_error()));
        }

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        let requested = requested_name.unwrap_or("tun%d");
        for (dst, src) in ifr.ifr_name.iter_mut().zip(requested.bytes()) {
            *dst = src as libc::c_char;
        }

        let res = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReq) };
        if res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TunError::SetIff(err));
        }

        let name = unsafe {
            let len = ifr.ifr_name.iter().position(|&c| c == 0).unwrap_or(IFNAMSIZ);
            String::from_utf8_lossy(std::slice::from_raw_parts(ifr.ifr_name.as_ptr() as *const u8, len))
                .into_owned()
        };

        // SAFETY: fd was just returned by a successful open() and not closed since.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Self { file, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one full IP packet into `buf`, returning the packet length.
    pub fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    /// Waits up to `timeout` for the device to become readable, standing
    /// in for the original's `select()`-with-timeout around the TUN fd
    /// (`spec.md` §5's "block in select with a 2 s timeout") so
    /// `TunIngress` can periodically observe `end_campagnol` instead of
    /// blocking in `read_packet` forever.
    pub fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0 && (pfd.revents & libc::POLLIN) != 0)
    }

    /// Write one full IP packet.
    pub fn write_packet(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution_replaces_every_placeholder() {
        let vars = TemplateVars {
            device: "tun0".to_string(),
            vpn_ip: Ipv4Addr::new(10, 0, 0, 2),
            mtu: 1400,
            network: "10.0.0.0/24".to_string(),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            local_port: 5000,
            local_ip: Ipv4Addr::new(192, 168, 1, 10),
        };
        let expanded = vars.expand("ifconfig %D %V mtu %M netmask %n port %P from %I net %N");
        assert_eq!(
            expanded,
            "ifconfig tun0 10.0.0.2 mtu 1400 netmask 255.255.255.0 port 5000 from 192.168.1.10 net 10.0.0.0/24"
        );
    }
}
