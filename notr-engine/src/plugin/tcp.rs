//! Published TCP ports

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinSet};

use super::{ForwardPlugin, ForwardRequest};
use crate::error::Result;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Listens on the broker and splices each connection to the client VIP
pub struct TcpPortForward {
    listeners: Mutex<HashMap<String, AbortHandle>>,
}

impl TcpPortForward {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for TcpPortForward {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardPlugin for TcpPortForward {
    fn provision(&self, request: &ForwardRequest) -> Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(request.from)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let bound = listener.local_addr()?;

        let task = tokio::spawn(accept_loop(listener, request.to));
        if let Some(old) = self.listeners.lock().insert(request.identity(), task.abort_handle()) {
            old.abort();
        }
        Ok(bound)
    }

    fn withdraw(&self, request: &ForwardRequest) {
        if let Some(handle) = self.listeners.lock().remove(&request.identity()) {
            handle.abort();
        }
    }
}

/// Accept until aborted; dropping the join set closes every open splice
async fn accept_loop(listener: TcpListener, to: SocketAddrV4) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    connections.spawn(async move {
                        if let Err(e) = splice(conn, to).await {
                            log::debug!("Forward {} -> {} ended: {}", peer, to, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept on forward to {} failed: {}", to, e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn splice(mut conn: TcpStream, to: SocketAddrV4) -> Result<()> {
    let mut upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(to)).await??;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ForwardProtocol;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_forward_relays_and_withdraws() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let plugin = TcpPortForward::new();
        let request = ForwardRequest {
            protocol: ForwardProtocol::Tcp,
            from: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            to: echo_addr,
            domain: "echo.notr".into(),
        };
        let bound = plugin.provision(&request).unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        plugin.withdraw(&request);
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(bound).await.is_err());
    }
}
