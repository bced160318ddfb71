//! Broker orchestrator
//!
//! Builds the shared pool and registry from the configuration, wires them
//! into the tunnel server and the configured forwarders, and runs all of
//! them under one shutdown channel.

use std::sync::Arc;

use notr_protocol::VipPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{BrokerEvent, EventHandler, LoggingEventHandler};
use crate::overlay::{run_device_reader, OverlayDevice};
use crate::plugin::PluginRegistry;
use crate::registry::SessionRegistry;
use crate::resolver::DomainResolver;
use crate::server::TunnelServer;
use crate::socket::{tproxy_tcp_listener, RawSocketInjector, TproxyUdpSocket};
use crate::tcp_forward::TcpForwarder;
use crate::udp_forward::UdpForwarder;

/// Tunnel broker
///
/// ```no_run
/// # async fn run() -> notr_engine::Result<()> {
/// let config = notr_engine::Config::load("notrd.toml")?;
/// let mut broker = notr_engine::Broker::new(config)?;
/// let shutdown = broker.create_shutdown_handle();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     let _ = shutdown.send(());
/// });
/// broker.run().await
/// # }
/// ```
pub struct Broker {
    config: Config,
    pool: Arc<VipPool>,
    registry: Arc<SessionRegistry>,
    plugins: Arc<PluginRegistry>,
    resolver: Option<Arc<dyn DomainResolver>>,
    overlay: Option<Arc<dyn OverlayDevice>>,
    event_handler: Arc<dyn EventHandler>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Broker {
    /// Create a broker with the built-in TCP and UDP port forward plugins
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = VipPool::new(config.gateway.network()?)?;

        Ok(Self {
            config,
            pool: Arc::new(pool),
            registry: Arc::new(SessionRegistry::new()),
            plugins: Arc::new(PluginRegistry::with_port_forwarders()),
            resolver: None,
            overlay: None,
            event_handler: Arc::new(LoggingEventHandler),
            shutdown_tx: None,
        })
    }

    /// Set the event handler
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Replace the forward plugin registry
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = Arc::new(plugins);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Attach the local overlay device
    pub fn with_overlay(mut self, device: Arc<dyn OverlayDevice>) -> Self {
        self.overlay = Some(device);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> Arc<VipPool> {
        self.pool.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Create a shutdown handle before running the broker
    ///
    /// Sending on the returned channel stops every component.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        shutdown_tx
    }

    /// Bind the control listener from the configuration and run
    pub async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.listen).await?;
        self.serve(listener).await
    }

    /// Run every component on an already bound control listener
    ///
    /// Forwarder socket setup happens before anything is served; a failure
    /// there aborts startup. Returns after shutdown, or with the first error
    /// that stopped a component.
    pub async fn serve(&mut self, listener: TcpListener) -> Result<()> {
        let shutdown_tx = match self.shutdown_tx.clone() {
            Some(tx) => tx,
            None => self.create_shutdown_handle(),
        };

        let tcp = match &self.config.tcp_forward {
            Some(cfg) => {
                let listener = tproxy_tcp_listener(cfg.listen)?;
                let forwarder = Arc::new(TcpForwarder::new(self.registry.clone(), cfg.clone()));
                Some((forwarder, listener))
            }
            None => None,
        };

        let udp = match &self.config.udp_forward {
            Some(cfg) => {
                let socket = TproxyUdpSocket::bind(cfg.listen)?;
                let injector = Arc::new(RawSocketInjector::new()?);
                let forwarder = UdpForwarder::new(self.registry.clone(), injector, cfg.clone());
                Some((forwarder, socket))
            }
            None => None,
        };

        let mut server = TunnelServer::new(
            self.config.server.clone(),
            self.pool.clone(),
            self.registry.clone(),
            self.plugins.clone(),
        )
        .with_event_handler(self.event_handler.clone());
        if let Some(resolver) = &self.resolver {
            server = server.with_resolver(resolver.clone());
        }
        if let Some(device) = &self.overlay {
            server = server.with_overlay(device.clone());
        }

        let listen = listener.local_addr()?;
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(Arc::new(server).serve(listener, shutdown_tx.clone()));
        self.emit(BrokerEvent::ServerReady {
            listen,
            cidr: self.pool.cidr(),
        })
        .await;

        if let Some((forwarder, listener)) = tcp {
            let listen = listener.local_addr()?;
            tasks.spawn(forwarder.serve(listener, shutdown_tx.subscribe()));
            self.emit(BrokerEvent::ForwarderStarted { kind: "tcp", listen }).await;
        }

        if let Some((forwarder, socket)) = udp {
            let listen = socket.local_addr()?;
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.spawn(async move { forwarder.serve(socket, shutdown_rx).await });
            self.emit(BrokerEvent::ForwarderStarted { kind: "udp", listen }).await;
        }

        if let Some(device) = &self.overlay {
            tasks.spawn(run_device_reader(
                device.clone(),
                self.registry.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => Error::Connection(format!("broker task failed: {}", e)),
            };
            log::error!("Broker component stopped: {}", err);
            self.emit(BrokerEvent::Error {
                message: err.to_string(),
                recoverable: false,
            })
            .await;
            let _ = shutdown_tx.send(());
            first_error.get_or_insert(err);
        }

        log::info!("Broker stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn emit(&self, event: BrokerEvent) {
        self.event_handler.on_event(event).await;
    }
}
