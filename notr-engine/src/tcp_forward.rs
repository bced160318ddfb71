//! Transparent TCP forwarder
//!
//! Accepts connections the host redirected with TPROXY, finds the session
//! owning the intercepted destination VIP and carries the connection over
//! a fresh stream on that client's tunnel. The stream starts with a
//! [`FlowDescriptor`] so the client knows which local service to dial.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use notr_protocol::{FlowDescriptor, FlowProtocol};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::TcpForwardConfig;
use crate::error::{Error, Result};
use crate::registry::{SessionRegistry, TunnelSession};

const COPY_BUFSIZE: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpForwarder {
    registry: Arc<SessionRegistry>,
    config: TcpForwardConfig,
}

impl TcpForwarder {
    pub fn new(registry: Arc<SessionRegistry>, config: TcpForwardConfig) -> Self {
        Self { registry, config }
    }

    /// Accept intercepted connections until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("TCP forwarder accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    // Under TPROXY the local address is the original destination
                    let (original_dst, peer) = match (conn.local_addr(), peer) {
                        (Ok(SocketAddr::V4(dst)), SocketAddr::V4(peer)) => (dst, peer),
                        (local, peer) => {
                            log::debug!("Ignoring non-IPv4 connection {:?} from {}", local, peer);
                            continue;
                        }
                    };

                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.forward_connection(conn, original_dst, peer).await {
                            log::debug!("TCP flow {} -> {} ended: {}", peer, original_dst, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    log::info!("TCP forwarder stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Carry one intercepted connection over its owner's tunnel
    ///
    /// Returns once either side closes; the other side is closed with it.
    pub async fn forward_connection<S>(
        &self,
        conn: S,
        original_dst: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let vip = *original_dst.ip();
        let session = self.registry.get(vip).ok_or(Error::NoRoute(vip))?;

        let mut stream = session.open_stream().await?;
        let descriptor = FlowDescriptor::new(
            FlowProtocol::Tcp,
            peer,
            self.config.flow_destination(original_dst),
        );
        let header = descriptor.encode()?;
        timeout(self.config.write_timeout(), async {
            stream.write_all(&header).await?;
            stream.flush().await
        })
        .await??;

        log::debug!("TCP flow {} -> {} opened on {}", peer, original_dst, vip);
        splice(conn, stream, &session).await
    }
}

/// Copy both ways until either direction finishes, then close both
async fn splice<A, B>(local: A, tunnel: B, session: &TunnelSession) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_r, mut local_w) = tokio::io::split(local);
    let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel);

    let result = tokio::select! {
        r = pump(&mut local_r, &mut tunnel_w, |n| session.record_tx(n)) => r,
        r = pump(&mut tunnel_r, &mut local_w, |n| session.record_rx(n)) => r,
    };

    let _ = local_w.shutdown().await;
    let _ = tunnel_w.shutdown().await;
    result?;
    Ok(())
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, count: impl Fn(usize)) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFSIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        count(n);
        total += n as u64;
    }
}
