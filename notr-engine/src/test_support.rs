//! In-memory tunnels for unit tests

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_yamux::{session::SessionType, Config as YamuxConfig, Session, StreamHandle};

use crate::registry::TunnelSession;

/// Broker-side session plus the client end of the same multiplexed tunnel
pub(crate) struct TestTunnel {
    pub session: Arc<TunnelSession>,
    /// Streams the broker opened towards the client
    pub inbound: mpsc::UnboundedReceiver<StreamHandle>,
    /// Drives the client session; aborting it closes the tunnel
    pub client: JoinHandle<()>,
}

pub(crate) fn tunnel(vip: Ipv4Addr) -> TestTunnel {
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);

    let mut server = Session::new(server_io, YamuxConfig::default(), SessionType::Server);
    let control = server.control();
    tokio::spawn(async move { while let Some(Ok(_)) = server.next().await {} });

    let mut client = Session::new(client_io, YamuxConfig::default(), SessionType::Client);
    let (tx, inbound) = mpsc::unbounded_channel();
    let client = tokio::spawn(async move {
        while let Some(Ok(stream)) = client.next().await {
            let _ = tx.send(stream);
        }
    });

    let session = Arc::new(TunnelSession::new(
        vip,
        "test.notr",
        "198.51.100.7:40000".parse().unwrap(),
        control,
    ));

    TestTunnel {
        session,
        inbound,
        client,
    }
}
