//! Published UDP ports

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::{AbortHandle, JoinSet};

use super::{ForwardPlugin, ForwardRequest};
use crate::error::Result;

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Relays datagrams between broker-side peers and the client VIP
///
/// Each peer address gets its own upstream socket so replies can be told
/// apart; upstreams idle for longer than the session timeout are closed.
pub struct UdpPortForward {
    session_timeout: Duration,
    relays: Mutex<HashMap<String, AbortHandle>>,
}

impl UdpPortForward {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            session_timeout,
            relays: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for UdpPortForward {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl ForwardPlugin for UdpPortForward {
    fn provision(&self, request: &ForwardRequest) -> Result<SocketAddr> {
        let std_socket = std::net::UdpSocket::bind(request.from)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let bound = socket.local_addr()?;

        let task = tokio::spawn(relay(Arc::new(socket), request.to, self.session_timeout));
        if let Some(old) = self.relays.lock().insert(request.identity(), task.abort_handle()) {
            old.abort();
        }
        Ok(bound)
    }

    fn withdraw(&self, request: &ForwardRequest) {
        if let Some(handle) = self.relays.lock().remove(&request.identity()) {
            handle.abort();
        }
    }
}

struct Upstream {
    socket: Arc<UdpSocket>,
    last_active: Instant,
    reader: AbortHandle,
}

async fn relay(listener: Arc<UdpSocket>, to: SocketAddrV4, timeout: Duration) {
    let mut upstreams: HashMap<SocketAddr, Upstream> = HashMap::new();
    let mut readers = JoinSet::new();
    let mut sweep = tokio::time::interval((timeout / 2).max(Duration::from_secs(1)));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            received = listener.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        log::error!("UDP forward to {} receive failed: {}", to, e);
                        break;
                    }
                };

                if !upstreams.contains_key(&peer) {
                    let socket = match connect_upstream(to).await {
                        Ok(s) => Arc::new(s),
                        Err(e) => {
                            log::error!("UDP forward to {} dial failed: {}", to, e);
                            continue;
                        }
                    };
                    let reader = readers.spawn(copy_back(socket.clone(), listener.clone(), peer));
                    upstreams.insert(peer, Upstream { socket, last_active: Instant::now(), reader });
                }

                if let Some(upstream) = upstreams.get_mut(&peer) {
                    upstream.last_active = Instant::now();
                    if let Err(e) = upstream.socket.send(&buf[..n]).await {
                        log::debug!("UDP forward {} -> {} send failed: {}", peer, to, e);
                    }
                }
            }
            _ = sweep.tick() => {
                upstreams.retain(|peer, upstream| {
                    let alive = upstream.last_active.elapsed() <= timeout;
                    if !alive {
                        log::debug!("UDP forward {} -> {} idle, closing", peer, to);
                        upstream.reader.abort();
                    }
                    alive
                });
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn connect_upstream(to: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(to).await?;
    Ok(socket)
}

async fn copy_back(upstream: Arc<UdpSocket>, listener: Arc<UdpSocket>, peer: SocketAddr) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match upstream.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                log::debug!("UDP upstream for {} closed: {}", peer, e);
                return;
            }
        };
        if let Err(e) = listener.send_to(&buf[..n], peer).await {
            log::debug!("UDP reply to {} failed: {}", peer, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ForwardProtocol;

    #[tokio::test]
    async fn test_udp_forward_relays_replies() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let plugin = UdpPortForward::new(Duration::from_secs(5));
        let request = ForwardRequest {
            protocol: ForwardProtocol::Udp,
            from: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            to: echo_addr,
            domain: "echo.notr".into(),
        };
        let bound = plugin.provision(&request).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", bound).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, bound);

        plugin.withdraw(&request);
    }
}
