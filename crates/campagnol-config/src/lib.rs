//! Typed configuration consumed by the client and RDV server cores.
//!
//! Parsing an on-disk file into these structs is a thin `serde`/`toml`
//! adapter — the INI-style grammar the original program used is treated as
//! an external collaborator and is not reproduced here (see `spec.md` §1).

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("invalid CIDR network {0:?}")]
    InvalidNetwork(String),
    #[error("vpn_ip {0} is not inside network {1}")]
    VpnIpOutsideNetwork(Ipv4Addr, String),
}

/// A parsed IPv4 CIDR block: `network_address/prefix_len`.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Network {
    network: u32,
    prefix_len: u32,
}

impl Ipv4Network {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidNetwork(s.to_string()))?;
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| ConfigError::InvalidNetwork(s.to_string()))?;
        let prefix_len: u32 = prefix_part
            .parse()
            .map_err(|_| ConfigError::InvalidNetwork(s.to_string()))?;
        if prefix_len > 32 {
            return Err(ConfigError::InvalidNetwork(s.to_string()));
        }
        let mask = Self::mask_for(prefix_len);
        let network = u32::from(addr) & mask;
        Ok(Self { network, prefix_len })
    }

    fn mask_for(prefix_len: u32) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & Self::mask_for(self.prefix_len)) == self.network
    }

    /// Highest address of the subnet — the VPN broadcast IP.
    pub fn broadcast_address(&self) -> Ipv4Addr {
        let host_bits = 32 - self.prefix_len;
        let host_mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
        Ipv4Addr::from(self.network | host_mask)
    }
}

/// Client-side configuration, matching the keys enumerated in `spec.md` §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub local_host: Option<IpAddr>,
    pub local_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub tun_mtu: u16,
    pub interface: Option<String>,
    pub use_local_addr: bool,
    pub vpn_ip: Ipv4Addr,
    pub network: String,
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub ca_certificates: PathBuf,
    pub crl_file: Option<PathBuf>,
    pub cipher_list: Option<String>,
    pub fifo_size: usize,
    pub client_max_rate: f64,
    pub connection_max_rate: f64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub timeout: Duration,
    pub max_clients: usize,
    pub if_up: Option<String>,
    pub if_down: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_host: None,
            local_port: 0,
            server_host: String::new(),
            server_port: 5000,
            tun_mtu: 1400,
            interface: None,
            use_local_addr: false,
            vpn_ip: Ipv4Addr::UNSPECIFIED,
            network: "10.0.0.0/24".to_string(),
            certificate: PathBuf::new(),
            key: PathBuf::new(),
            ca_certificates: PathBuf::new(),
            crl_file: None,
            cipher_list: None,
            fifo_size: 100,
            client_max_rate: 0.0,
            connection_max_rate: 0.0,
            timeout: Duration::from_secs(120),
            max_clients: 0,
            if_up: None,
            if_down: None,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn network(&self) -> Result<Ipv4Network, ConfigError> {
        let net = Ipv4Network::parse(&self.network)?;
        if !net.contains(self.vpn_ip) {
            return Err(ConfigError::VpnIpOutsideNetwork(self.vpn_ip, self.network.clone()));
        }
        Ok(net)
    }

    /// Highest address of the VPN subnet, used for VPN-wide broadcasts.
    pub fn vpn_broadcast_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        Ok(self.network()?.broadcast_address())
    }

    /// Derived keepalive interval: a third of the idle timeout, matching
    /// the ~10s/30s ratio used in the worked example in `spec.md` §8.
    pub fn keepalive_interval(&self) -> Duration {
        (self.timeout / 3).max(Duration::from_secs(1))
    }
}

/// Accepts either a bare integer (seconds, matching the original config
/// file's plain-number convention) or a human-friendly duration string
/// such as `"2m"` or `"90s"`, via the `humantime` crate.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> serde::de::Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a number of seconds or a duration string like \"90s\"")
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v.max(0) as u64))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
            humantime::parse_duration(v).map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// RDV server-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: Option<IpAddr>,
    pub port: u16,
    pub max_clients: usize,
    pub pidfile: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            port: 5000,
            max_clients: 0,
            pidfile: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_client_config_network_is_consistent() {
        let mut cfg = ClientConfig::default();
        cfg.vpn_ip = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(cfg.vpn_broadcast_ip().unwrap(), Ipv4Addr::new(10, 0, 0, 255));
    }

    #[test]
    fn rejects_vpn_ip_outside_network() {
        let mut cfg = ClientConfig::default();
        cfg.vpn_ip = Ipv4Addr::new(192, 168, 1, 2);
        assert!(matches!(cfg.network(), Err(ConfigError::VpnIpOutsideNetwork(_, _))));
    }

    #[test]
    fn keepalive_is_a_third_of_timeout() {
        let mut cfg = ClientConfig::default();
        cfg.timeout = Duration::from_secs(30);
        assert_eq!(cfg.keepalive_interval(), Duration::from_secs(10));
    }

    #[derive(Deserialize)]
    struct DurationWrapper {
        #[serde(deserialize_with = "deserialize_duration_secs")]
        timeout: Duration,
    }

    #[test]
    fn timeout_accepts_a_bare_number_of_seconds() {
        let wrapper: DurationWrapper = toml::from_str("timeout = 90").unwrap();
        assert_eq!(wrapper.timeout, Duration::from_secs(90));
    }

    #[test]
    fn timeout_accepts_a_humantime_string() {
        let wrapper: DurationWrapper = toml::from_str("timeout = \"2m\"").unwrap();
        assert_eq!(wrapper.timeout, Duration::from_secs(120));
    }
}
