//! Notr Engine
//!
//! The tunnel broker: clients connect over TCP, authenticate with a shared
//! key and receive a virtual IP from the overlay network. Their connection
//! then becomes a yamux session that the broker uses to reach them.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   tunnel TCP ──▶│ TunnelServer                 │
//!                 │  auth → VIP → reply → mux    │
//!                 └──────┬──────────────┬────────┘
//!                        │ put/delete   │ select/release
//!                        ▼              ▼
//!                 ┌───────────────┐ ┌─────────┐
//!                 │SessionRegistry│ │ VipPool │
//!                 └──────▲────────┘ └─────────┘
//!                        │ get(dst VIP) → open_stream
//!          ┌─────────────┼──────────────┐
//!          │             │              │
//!   ┌──────┴──────┐ ┌────┴────────┐ ┌───┴──────────┐
//!   │TcpForwarder │ │UdpForwarder │ │overlay relay │
//!   │ TPROXY TCP  │ │ TPROXY UDP  │ │ device ⇄ mux │
//!   └─────────────┘ │ + raw reply │ └──────────────┘
//!                   └─────────────┘
//! ```
//!
//! [`Broker`] builds and runs all of it from a [`Config`].

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod overlay;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod socket;
pub mod tcp_forward;
pub mod udp_forward;

#[cfg(test)]
mod test_support;

pub use broker::Broker;
pub use config::{Config, GatewayConfig, ServerConfig, TcpForwardConfig, UdpForwardConfig};
pub use error::{Error, Result};
pub use event::{BrokerEvent, EventHandler, LoggingEventHandler};
pub use overlay::OverlayDevice;
pub use plugin::{ForwardPlugin, ForwardProtocol, ForwardRequest, PluginRegistry};
pub use registry::{SessionRegistry, TunnelSession};
pub use resolver::DomainResolver;
pub use server::TunnelServer;
pub use socket::PacketInjector;
pub use tcp_forward::TcpForwarder;
pub use udp_forward::{FlowKey, UdpForwarder};
