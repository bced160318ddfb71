//! Configuration types for the broker engine

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [server]
/// listen = "0.0.0.0:9641"
/// auth_key = "my-secret-key"
/// domain = "notr.example.com"
///
/// [gateway]
/// cidr = "100.64.240.0/24"
///
/// [tcp_forward]
/// listen = "0.0.0.0:8520"
///
/// [udp_forward]
/// listen = "0.0.0.0:8521"
/// session_timeout = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel control server settings
    pub server: ServerConfig,

    /// Overlay network settings
    pub gateway: GatewayConfig,

    /// Transparent TCP forwarder; disabled when absent
    #[serde(default)]
    pub tcp_forward: Option<TcpForwardConfig>,

    /// Transparent UDP forwarder; disabled when absent
    #[serde(default)]
    pub udp_forward: Option<UdpForwardConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.gateway.validate()?;

        if let Some(ref tcp) = self.tcp_forward {
            if tcp.write_timeout == 0 {
                return Err(Error::Config("tcp_forward.write_timeout must be positive".into()));
            }
        }

        if let Some(ref udp) = self.udp_forward {
            udp.validate()?;
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# notrd tunnel broker configuration

[server]
# Address the tunnel control server listens on
listen = "0.0.0.0:9641"

# Shared secret clients must present (required)
auth_key = "your-secret-key-here"

# Suffix for domains generated for clients that do not request one
domain = "notr.example.com"

# Public address published to the domain resolver (optional)
# public_ip = "203.0.113.7"

# Deadline for each control frame read/write, in seconds (default: 30)
control_timeout = 30

# How often per-session counters are sampled and reset, in seconds (default: 10)
stats_interval = 10

[gateway]
# Overlay network; every host address is assignable as a client VIP
cidr = "100.64.240.0/24"

# Transparent TCP forwarder. Remove the section to disable it.
# Requires a TPROXY rule steering VIP-bound TCP traffic to this port.
[tcp_forward]
listen = "0.0.0.0:8520"
# Destination address announced to the client for each forwarded flow
target_ip = "127.0.0.1"
# Announce the intercepted destination address instead of target_ip
preserve_destination = false
write_timeout = 10

# Transparent UDP forwarder. Remove the section to disable it.
[udp_forward]
listen = "0.0.0.0:8521"
target_ip = "127.0.0.1"
preserve_destination = false
# Idle flows are closed after this many seconds (default: 30)
session_timeout = 30
# Idle flow sweep period in seconds (default: 5)
reap_interval = 5
write_timeout = 10
"#
        .to_string()
    }
}

/// Tunnel control server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the tunnel control listener
    pub listen: SocketAddr,

    /// Shared secret every client must present in its auth request
    pub auth_key: String,

    /// Suffix appended to generated client domains
    pub domain: String,

    /// Public address published to the domain resolver, if any
    #[serde(default)]
    pub public_ip: Option<Ipv4Addr>,

    /// Per-frame deadline on the control channel (seconds)
    #[serde(default = "default_control_timeout")]
    pub control_timeout: u64,

    /// Session counter sampling period (seconds)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth_key.is_empty() {
            return Err(Error::Config("auth_key is required".into()));
        }

        if self.domain.trim_matches('.').is_empty() {
            return Err(Error::Config("domain is required".into()));
        }

        if self.control_timeout == 0 || self.stats_interval == 0 {
            return Err(Error::Config(
                "control_timeout and stats_interval must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }
}

/// Overlay network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Overlay network in CIDR notation
    pub cidr: String,
}

impl GatewayConfig {
    /// Validate the overlay network
    pub fn validate(&self) -> Result<()> {
        let net = self.network()?;
        if net.prefix_len() > 30 {
            return Err(Error::Config(format!(
                "gateway cidr {} has no usable host addresses",
                self.cidr
            )));
        }
        Ok(())
    }

    /// Get the overlay network as an Ipv4Net
    pub fn network(&self) -> Result<ipnet::Ipv4Net> {
        self.cidr
            .parse()
            .map_err(|e| Error::Config(format!("invalid gateway cidr {}: {}", self.cidr, e)))
    }
}

/// Transparent TCP forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpForwardConfig {
    /// TPROXY listener address
    pub listen: SocketAddr,

    /// Destination announced in flow descriptors
    #[serde(default = "default_target_ip")]
    pub target_ip: Ipv4Addr,

    /// Announce the intercepted destination instead of `target_ip`
    #[serde(default)]
    pub preserve_destination: bool,

    /// Deadline for writing the flow descriptor (seconds)
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl TcpForwardConfig {
    /// Destination written into the descriptor for an intercepted flow
    pub fn flow_destination(&self, original: SocketAddrV4) -> SocketAddrV4 {
        if self.preserve_destination {
            original
        } else {
            SocketAddrV4::new(self.target_ip, original.port())
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

/// Transparent UDP forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpForwardConfig {
    /// TPROXY listener address
    pub listen: SocketAddr,

    /// Destination announced in flow descriptors
    #[serde(default = "default_target_ip")]
    pub target_ip: Ipv4Addr,

    /// Announce the intercepted destination instead of `target_ip`
    #[serde(default)]
    pub preserve_destination: bool,

    /// Idle timeout per flow (seconds)
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Idle flow sweep period (seconds)
    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,

    /// Deadline for writes onto a flow stream (seconds)
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl UdpForwardConfig {
    /// Validate UDP forwarder timings
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout == 0 || self.reap_interval == 0 || self.write_timeout == 0 {
            return Err(Error::Config("udp_forward timeouts must be positive".into()));
        }
        if self.reap_interval > self.session_timeout {
            return Err(Error::Config(format!(
                "udp_forward.reap_interval ({}) must not exceed session_timeout ({})",
                self.reap_interval, self.session_timeout
            )));
        }
        Ok(())
    }

    /// Destination written into the descriptor for an intercepted flow
    pub fn flow_destination(&self, original: SocketAddrV4) -> SocketAddrV4 {
        if self.preserve_destination {
            original
        } else {
            SocketAddrV4::new(self.target_ip, original.port())
        }
    }
}

fn default_control_timeout() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    10
}

fn default_target_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_write_timeout() -> u64 {
    10
}

fn default_session_timeout() -> u64 {
    30
}

fn default_reap_interval() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
listen = "0.0.0.0:9641"
auth_key = "test-key"
domain = "notr.test"

[gateway]
cidr = "100.64.0.0/24"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.auth_key, "test-key");
        assert_eq!(config.server.control_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.stats_interval(), Duration::from_secs(10));
        assert!(config.server.public_ip.is_none());
        assert!(config.tcp_forward.is_none());
        assert!(config.udp_forward.is_none());
    }

    #[test]
    fn test_parse_forwarders_with_defaults() {
        let toml = r#"
[server]
listen = "0.0.0.0:9641"
auth_key = "k"
domain = "notr.test"

[gateway]
cidr = "100.64.0.0/24"

[tcp_forward]
listen = "0.0.0.0:8520"

[udp_forward]
listen = "0.0.0.0:8521"
preserve_destination = true
"#;

        let config = Config::from_toml(toml).unwrap();
        let tcp = config.tcp_forward.unwrap();
        assert_eq!(tcp.target_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(tcp.write_timeout(), Duration::from_secs(10));

        let udp = config.udp_forward.unwrap();
        assert_eq!(udp.session_timeout, 30);
        assert_eq!(udp.reap_interval, 5);

        let original = SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 10), 53);
        assert_eq!(udp.flow_destination(original), original);
        assert_eq!(
            tcp.flow_destination(original),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53)
        );
    }

    #[test]
    fn test_missing_key_fails() {
        let toml = r#"
[server]
listen = "0.0.0.0:9641"
auth_key = ""
domain = "notr.test"

[gateway]
cidr = "100.64.0.0/24"
"#;

        assert!(Config::from_toml(toml).unwrap_err().is_config_error());
    }

    #[test]
    fn test_bad_cidr_fails() {
        for cidr in ["100.64.0.0", "fd00::/64", "100.64.0.0/31"] {
            let toml = format!(
                "[server]\nlisten = \"0.0.0.0:9641\"\nauth_key = \"k\"\ndomain = \"d\"\n\n[gateway]\ncidr = \"{}\"\n",
                cidr
            );
            assert!(Config::from_toml(&toml).is_err(), "{} accepted", cidr);
        }
    }

    #[test]
    fn test_reap_interval_bounded_by_timeout() {
        let udp = UdpForwardConfig {
            listen: "0.0.0.0:8521".parse().unwrap(),
            target_ip: Ipv4Addr::LOCALHOST,
            preserve_destination: false,
            session_timeout: 5,
            reap_interval: 10,
            write_timeout: 10,
        };
        assert!(udp.validate().is_err());
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert!(config.tcp_forward.is_some());
        assert!(config.udp_forward.is_some());
    }
}
