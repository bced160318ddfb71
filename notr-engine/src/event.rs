//! Broker events

use std::net::{Ipv4Addr, SocketAddr};

/// Events emitted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Tunnel control server is accepting connections
    ServerReady {
        listen: SocketAddr,
        /// Overlay network handed out to clients
        cidr: String,
    },

    /// A transparent forwarder is accepting intercepted traffic
    ForwarderStarted {
        /// "tcp" or "udp"
        kind: &'static str,
        listen: SocketAddr,
    },

    /// Client authenticated and its session is registered
    ClientConnected {
        vip: Ipv4Addr,
        domain: String,
        peer: SocketAddr,
    },

    /// Client session torn down and its VIP released
    ClientDisconnected {
        vip: Ipv4Addr,
        reason: String,
    },

    /// Byte counters sampled for one session since the previous sample
    SessionStats {
        vip: Ipv4Addr,
        rx_bytes: u64,
        tx_bytes: u64,
    },

    /// Error occurred
    Error {
        message: String,
        recoverable: bool,
    },
}

/// Event handler trait for receiving broker events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a broker event
    async fn on_event(&self, event: BrokerEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::ServerReady { listen, cidr } => {
                log::info!("Tunnel server ready: listen={}, overlay={}", listen, cidr);
            }
            BrokerEvent::ForwarderStarted { kind, listen } => {
                log::info!("Transparent {} forwarder listening on {}", kind, listen);
            }
            BrokerEvent::ClientConnected { vip, domain, peer } => {
                log::info!("Client connected: vip={}, domain={}, peer={}", vip, domain, peer);
            }
            BrokerEvent::ClientDisconnected { vip, reason } => {
                log::info!("Client disconnected: vip={}, reason={}", vip, reason);
            }
            BrokerEvent::SessionStats {
                vip,
                rx_bytes,
                tx_bytes,
            } => {
                log::debug!("Session {}: rx={} tx={}", vip, rx_bytes, tx_bytes);
            }
            BrokerEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
        }
    }
}
