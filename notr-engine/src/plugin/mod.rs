//! Forward provisioning for ports published by clients
//!
//! A client may ask the broker to publish some of its services: for each
//! request the broker listens on `0.0.0.0:{local port}` and relays to
//! `{vip}:{remote port}` across the overlay. Each protocol is handled by
//! a [`ForwardPlugin`]; the [`PluginRegistry`] owns the set of active
//! forwards and refuses to provision the same one twice.

mod tcp;
mod udp;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use notr_protocol::AuthRequest;
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub use tcp::TcpPortForward;
pub use udp::UdpPortForward;

/// Protocol of a published forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardProtocol {
    Tcp,
    Udp,
    Http,
    Https,
    Grpc,
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForwardProtocol::Tcp => "tcp",
            ForwardProtocol::Udp => "udp",
            ForwardProtocol::Http => "http",
            ForwardProtocol::Https => "https",
            ForwardProtocol::Grpc => "grpc",
        };
        f.write_str(name)
    }
}

/// One forward requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub protocol: ForwardProtocol,
    /// Broker-side listen address
    pub from: SocketAddr,
    /// Client service on its VIP
    pub to: SocketAddrV4,
    /// Client domain, used by name-based proxies
    pub domain: String,
}

impl ForwardRequest {
    /// Key under which the registry tracks this forward
    pub fn identity(&self) -> String {
        format!("{}:{}:{}", self.protocol, self.from, self.domain)
    }

    /// Expand the forwards carried in an auth request
    ///
    /// Port maps become `0.0.0.0:{local}` to `{vip}:{remote}`. Web services
    /// are routed by domain, so their listen port is left unspecified.
    pub fn from_auth(auth: &AuthRequest, vip: Ipv4Addr, domain: &str) -> Vec<Self> {
        let make = |protocol, local: u16, remote: u16| ForwardRequest {
            protocol,
            from: SocketAddr::from((Ipv4Addr::UNSPECIFIED, local)),
            to: SocketAddrV4::new(vip, remote),
            domain: domain.to_string(),
        };

        let mut requests = Vec::new();
        for (protocol, port) in [
            (ForwardProtocol::Http, auth.http),
            (ForwardProtocol::Https, auth.https),
            (ForwardProtocol::Grpc, auth.grpc),
        ] {
            if port != 0 {
                requests.push(make(protocol, 0, port));
            }
        }
        for (&local, &remote) in &auth.tcps {
            requests.push(make(ForwardProtocol::Tcp, local, remote));
        }
        for (&local, &remote) in &auth.udps {
            requests.push(make(ForwardProtocol::Udp, local, remote));
        }
        requests
    }
}

impl fmt::Display for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {} ({})", self.protocol, self.from, self.to, self.domain)
    }
}

/// Handler for one forward protocol
pub trait ForwardPlugin: Send + Sync {
    /// Start serving `request`, returning the address actually bound
    fn provision(&self, request: &ForwardRequest) -> Result<SocketAddr>;

    /// Stop serving `request`; unknown requests are ignored
    fn withdraw(&self, request: &ForwardRequest);
}

/// Dispatches forwards to their protocol handler and tracks active ones
#[derive(Default)]
pub struct PluginRegistry {
    handlers: HashMap<ForwardProtocol, Arc<dyn ForwardPlugin>>,
    active: Mutex<HashSet<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in TCP and UDP port forwarders
    pub fn with_port_forwarders() -> Self {
        Self::new()
            .register(ForwardProtocol::Tcp, Arc::new(TcpPortForward::new()))
            .register(ForwardProtocol::Udp, Arc::new(UdpPortForward::default()))
    }

    /// Install the handler for `protocol`, replacing any previous one
    pub fn register(mut self, protocol: ForwardProtocol, plugin: Arc<dyn ForwardPlugin>) -> Self {
        self.handlers.insert(protocol, plugin);
        self
    }

    pub fn supports(&self, protocol: ForwardProtocol) -> bool {
        self.handlers.contains_key(&protocol)
    }

    /// Provision one forward
    pub fn add_forward(&self, request: &ForwardRequest) -> Result<SocketAddr> {
        let mut active = self.active.lock();
        let key = request.identity();
        if active.contains(&key) {
            return Err(Error::Plugin(format!("port {} is already in use", key)));
        }

        let plugin = self
            .handlers
            .get(&request.protocol)
            .ok_or_else(|| Error::Plugin(format!("no handler registered for {}", request.protocol)))?;

        let bound = plugin.provision(request)?;
        active.insert(key);
        log::info!("Provisioned forward {}", request);
        Ok(bound)
    }

    /// Withdraw one forward
    pub fn remove_forward(&self, request: &ForwardRequest) {
        let mut active = self.active.lock();
        if let Some(plugin) = self.handlers.get(&request.protocol) {
            plugin.withdraw(request);
        }
        if active.remove(&request.identity()) {
            log::info!("Withdrew forward {}", request);
        }
    }

    pub fn is_active(&self, request: &ForwardRequest) -> bool {
        self.active.lock().contains(&request.identity())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}
