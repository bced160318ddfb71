//! Tunnel control server
//!
//! Each accepted connection goes through the handshake in order:
//!
//! 1. read one `auth` frame and check the shared key
//! 2. take a VIP from the pool
//! 3. reply with the VIP, the overlay network and the client domain
//! 4. publish the domain and provision the requested forwards
//! 5. wrap the connection in a yamux session and register it
//! 6. supervise until the connection closes or the broker stops
//!
//! Every resource taken along the way is held by a guard. Guards drop in
//! reverse order of acquisition, so the registry entry goes first, then
//! the forwards, and the VIP returns to the pool last. The same unwind
//! runs whether the handshake fails halfway or an established session
//! ends.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use notr_protocol::{read_frame, write_frame, AuthReply, AuthRequest, Command, Frame, VipPool};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_yamux::{session::SessionType, Config as YamuxConfig, Session, StreamHandle};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::{BrokerEvent, EventHandler, LoggingEventHandler};
use crate::overlay::{serve_overlay_stream, OverlayDevice};
use crate::plugin::{ForwardRequest, PluginRegistry};
use crate::registry::{SessionRegistry, TunnelSession};
use crate::resolver::DomainResolver;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const DOMAIN_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a client domain label from a time-derived seed
pub fn generate_domain(seed: u128, suffix: &str) -> String {
    let mut label = Vec::new();
    let mut n = seed;
    loop {
        label.push(DOMAIN_ALPHABET[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    label.reverse();
    format!(
        "{}.{}",
        String::from_utf8_lossy(&label),
        suffix.trim_matches('.')
    )
}

fn domain_seed() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// A VIP taken from the pool, returned on drop
struct VipLease<'a> {
    pool: &'a VipPool,
    vip: Ipv4Addr,
}

impl<'a> VipLease<'a> {
    fn acquire(pool: &'a VipPool) -> Result<Self> {
        let vip = pool
            .select()
            .map_err(|e| Error::AddressAllocation(e.to_string()))?;
        Ok(Self { pool, vip })
    }
}

impl Drop for VipLease<'_> {
    fn drop(&mut self) {
        if self.pool.release(self.vip) {
            log::debug!("Released VIP {}", self.vip);
        } else {
            log::warn!("VIP {} was not in use at release", self.vip);
        }
    }
}

/// Forwards provisioned for one client, withdrawn newest first on drop
struct ProvisionedForwards<'a> {
    plugins: &'a PluginRegistry,
    requests: Vec<ForwardRequest>,
}

impl<'a> ProvisionedForwards<'a> {
    fn new(plugins: &'a PluginRegistry) -> Self {
        Self {
            plugins,
            requests: Vec::new(),
        }
    }

    fn provision(&mut self, request: ForwardRequest) -> Result<()> {
        self.plugins.add_forward(&request)?;
        self.requests.push(request);
        Ok(())
    }
}

impl Drop for ProvisionedForwards<'_> {
    fn drop(&mut self) {
        for request in self.requests.iter().rev() {
            self.plugins.remove_forward(request);
        }
    }
}

/// Registry membership of one session
struct RegistryEntry<'a> {
    registry: &'a SessionRegistry,
    session: Arc<TunnelSession>,
}

impl<'a> RegistryEntry<'a> {
    fn insert(registry: &'a SessionRegistry, session: Arc<TunnelSession>) -> Self {
        if let Some(stale) = registry.put(session.vip(), session.clone()) {
            log::warn!("Replaced stale session for {} from {}", stale.vip(), stale.peer());
        }
        Self { registry, session }
    }
}

impl Drop for RegistryEntry<'_> {
    fn drop(&mut self) {
        self.registry.remove_session(&self.session);
    }
}

/// Accepts tunnels and runs each through handshake and supervision
pub struct TunnelServer {
    config: ServerConfig,
    pool: Arc<VipPool>,
    registry: Arc<SessionRegistry>,
    plugins: Arc<PluginRegistry>,
    resolver: Option<Arc<dyn DomainResolver>>,
    overlay: Option<Arc<dyn OverlayDevice>>,
    events: Arc<dyn EventHandler>,
}

impl TunnelServer {
    pub fn new(
        config: ServerConfig,
        pool: Arc<VipPool>,
        registry: Arc<SessionRegistry>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            config,
            pool,
            registry,
            plugins,
            resolver: None,
            overlay: None,
            events: Arc::new(LoggingEventHandler),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Relay overlay packets between `device` and client overlay streams
    pub fn with_overlay(mut self, device: Arc<dyn OverlayDevice>) -> Self {
        self.overlay = Some(device);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Accept tunnel connections until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Tunnel accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let _ = conn.set_nodelay(true);

                    let this = self.clone();
                    let conn_shutdown = shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        this.run_connection(conn, peer, conn_shutdown).await;
                    });
                }
                _ = shutdown_rx.recv() => {
                    log::info!("Tunnel server stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Run one connection to completion, reporting a failed handshake
    pub async fn run_connection<S>(&self, conn: S, peer: SocketAddr, shutdown_rx: broadcast::Receiver<()>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = self.handle_connection(conn, peer, shutdown_rx).await {
            log::warn!("Tunnel from {} failed: {}", peer, e);
            self.events
                .on_event(BrokerEvent::Error {
                    message: format!("tunnel from {}: {}", peer, e),
                    recoverable: e.is_recoverable(),
                })
                .await;
        }
    }

    /// Handshake, establish and supervise one tunnel
    ///
    /// Returns `Ok` once an established session has been torn down; errors
    /// are handshake failures, after which nothing stays allocated.
    pub async fn handle_connection<S>(
        &self,
        mut conn: S,
        peer: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let deadline = self.config.control_timeout();

        let frame = timeout(deadline, read_frame(&mut conn)).await??;
        if frame.command != Command::Auth {
            return Err(notr_protocol::Error::UnexpectedCommand(frame.command).into());
        }
        let auth = AuthRequest::from_json(&frame.body)?;
        if auth.key != self.config.auth_key {
            return Err(Error::Auth(format!("invalid key from {}", peer)));
        }

        let lease = VipLease::acquire(&self.pool)?;
        let vip = lease.vip;

        let domain = if auth.domain.is_empty() {
            generate_domain(domain_seed(), &self.config.domain)
        } else {
            auth.domain.clone()
        };

        let reply = AuthReply {
            domain: domain.clone(),
            vip: vip.to_string(),
            gateway: self.pool.cidr(),
        };
        timeout(deadline, write_frame(&mut conn, &Frame::auth(reply.to_json()?))).await??;

        if let (Some(resolver), Some(public_ip)) = (&self.resolver, self.config.public_ip) {
            resolver.apply(&domain, public_ip).await?;
        }

        let mut forwards = ProvisionedForwards::new(&self.plugins);
        for request in ForwardRequest::from_auth(&auth, vip, &domain) {
            if !self.plugins.supports(request.protocol) {
                log::warn!("No {} handler, not publishing {}", request.protocol, request);
                continue;
            }
            forwards.provision(request)?;
        }

        let mut mux = Session::new(conn, YamuxConfig::default(), SessionType::Server);
        let session = Arc::new(TunnelSession::new(vip, domain.clone(), peer, mux.control()));
        let entry = RegistryEntry::insert(&self.registry, session.clone());

        self.events
            .on_event(BrokerEvent::ClientConnected {
                vip,
                domain,
                peer,
            })
            .await;

        let reason = self.supervise(&mut mux, &session, &mut shutdown_rx).await;

        drop(mux);
        drop(entry);
        drop(forwards);
        drop(lease);

        self.events
            .on_event(BrokerEvent::ClientDisconnected { vip, reason })
            .await;
        Ok(())
    }

    /// Wait for the session to end, sampling its counters meanwhile
    async fn supervise<T>(
        &self,
        mux: &mut Session<T>,
        session: &Arc<TunnelSession>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> String
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stats = interval(self.config.stats_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats.tick().await;

        // Aborted on return, taking the overlay streams down with the session
        let mut overlay_tasks = JoinSet::new();

        loop {
            tokio::select! {
                inbound = mux.next() => match inbound {
                    Some(Ok(stream)) => self.accept_stream(stream, session, &mut overlay_tasks),
                    Some(Err(e)) => return format!("transport error: {}", e),
                    None => return "connection closed".to_string(),
                },
                _ = stats.tick() => {
                    let (rx_bytes, tx_bytes) = session.take_counters();
                    self.events
                        .on_event(BrokerEvent::SessionStats {
                            vip: session.vip(),
                            rx_bytes,
                            tx_bytes,
                        })
                        .await;
                }
                Some(_) = overlay_tasks.join_next(), if !overlay_tasks.is_empty() => {}
                _ = shutdown_rx.recv() => return "broker shutting down".to_string(),
            }
        }
    }

    fn accept_stream(
        &self,
        stream: StreamHandle,
        session: &Arc<TunnelSession>,
        tasks: &mut JoinSet<()>,
    ) {
        let Some(device) = self.overlay.clone() else {
            log::debug!("Client {} opened a stream but no overlay device is attached", session.vip());
            return;
        };

        let session = session.clone();
        let read_timeout = self.config.control_timeout();
        tasks.spawn(async move {
            let vip = session.vip();
            if let Err(e) = serve_overlay_stream(stream, session, device, read_timeout).await {
                log::debug!("Overlay stream for {} ended: {}", vip, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_domain_base36() {
        assert_eq!(generate_domain(0, "notr.test"), "0.notr.test");
        assert_eq!(generate_domain(35, "notr.test"), "z.notr.test");
        assert_eq!(generate_domain(36, ".notr.test."), "10.notr.test");

        let a = generate_domain(1_700_000_000_000_000_001, "n");
        let b = generate_domain(1_700_000_000_000_000_002, "n");
        assert_ne!(a, b);
        assert!(a.trim_end_matches(".n").bytes().all(|c| DOMAIN_ALPHABET.contains(&c)));
    }

    #[test]
    fn test_lease_returns_vip_on_drop() {
        let pool = VipPool::from_cidr("100.64.0.0/30").unwrap();
        let lease = VipLease::acquire(&pool).unwrap();
        assert!(pool.is_in_use(lease.vip));
        let vip = lease.vip;
        drop(lease);
        assert!(!pool.is_in_use(vip));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_lease_exhaustion_is_allocation_error() {
        let pool = VipPool::from_cidr("100.64.0.0/30").unwrap();
        let _a = VipLease::acquire(&pool).unwrap();
        let _b = VipLease::acquire(&pool).unwrap();
        let err = VipLease::acquire(&pool).err().unwrap();
        assert!(matches!(err, Error::AddressAllocation(_)));
        assert!(err.is_recoverable());
    }
}
