//! Transparent UDP forwarder
//!
//! Datagrams redirected by TPROXY are grouped into flows keyed by
//! `(peer, original destination)`. Each flow owns one stream on the tunnel
//! of the client holding the destination VIP: the stream opens with a
//! [`FlowDescriptor`], then carries every datagram as a `[len:u16][payload]`
//! record. Replies read back from the stream are rebuilt into IPv4/UDP
//! datagrams sourced from the original destination and re-injected through
//! a raw socket, so the peer sees an answer from the address it contacted.
//!
//! Idle flows are closed by a periodic sweep.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notr_protocol::{build_udp_packet, read_prefixed, write_prefixed, FlowDescriptor, FlowProtocol};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_yamux::StreamHandle;

use crate::config::UdpForwardConfig;
use crate::error::{Error, Result};
use crate::registry::{SessionRegistry, TunnelSession};
use crate::socket::{PacketInjector, TproxyUdpSocket};

const RECV_BUFSIZE: usize = 65535;
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Datagrams a flow may hold while its stream is slow; beyond this they drop
const FLOW_QUEUE_DEPTH: usize = 64;

/// Identity of one UDP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// True sender of the intercepted datagrams
    pub peer: SocketAddrV4,
    /// Destination the peer addressed, a client VIP
    pub original_dst: SocketAddrV4,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.peer.ip(),
            self.peer.port(),
            self.original_dst.ip(),
            self.original_dst.port()
        )
    }
}

struct UdpFlow {
    id: u64,
    queue: mpsc::Sender<Vec<u8>>,
    /// Milliseconds since the table epoch, refreshed by traffic either way
    last_active: Arc<AtomicU64>,
    reverse: AbortHandle,
}

/// Active flows; an entry lives exactly as long as its stream
struct FlowTable {
    entries: Mutex<HashMap<FlowKey, Arc<UdpFlow>>>,
    next_id: AtomicU64,
    epoch: Instant,
}

impl FlowTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self, last_active: &AtomicU64) {
        last_active.store(self.now_ms(), Ordering::Relaxed);
    }

    fn get(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        self.entries.lock().get(key).cloned()
    }

    /// Remove `key` only if it still names flow `id`
    fn remove_if_same(&self, key: &FlowKey, id: u64) -> Option<Arc<UdpFlow>> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|flow| flow.id == id) {
            entries.remove(key)
        } else {
            None
        }
    }

    fn take_idle(&self, idle: Duration) -> Vec<(FlowKey, Arc<UdpFlow>)> {
        let now = self.now_ms();
        let idle = idle.as_millis() as u64;
        let mut entries = self.entries.lock();
        let expired: Vec<FlowKey> = entries
            .iter()
            .filter(|(_, flow)| now.saturating_sub(flow.last_active.load(Ordering::Relaxed)) > idle)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|flow| (key, flow)))
            .collect()
    }

    fn take_all(&self) -> Vec<(FlowKey, Arc<UdpFlow>)> {
        self.entries.lock().drain().collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct UdpForwarder {
    registry: Arc<SessionRegistry>,
    injector: Arc<dyn PacketInjector>,
    flows: Arc<FlowTable>,
    config: UdpForwardConfig,
}

impl UdpForwarder {
    pub fn new(
        registry: Arc<SessionRegistry>,
        injector: Arc<dyn PacketInjector>,
        config: UdpForwardConfig,
    ) -> Self {
        Self {
            registry,
            injector,
            flows: Arc::new(FlowTable::new()),
            config,
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_timeout)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.config.write_timeout)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Receive intercepted datagrams and sweep idle flows until shutdown
    pub async fn serve(
        &self,
        socket: TproxyUdpSocket,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFSIZE];
        let mut reaper = interval(Duration::from_secs(self.config.reap_interval));
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reaper.tick().await;

        loop {
            tokio::select! {
                received = socket.recv_original(&mut buf) => {
                    let meta = match received {
                        Ok(meta) => meta,
                        Err(e) => {
                            recv_backoff(&e).await;
                            continue;
                        }
                    };
                    let Some(original_dst) = meta.original_dst else {
                        log::debug!("Datagram from {} carried no original destination, dropped", meta.peer);
                        continue;
                    };
                    if let Err(e) = self.handle_datagram(meta.peer, original_dst, &buf[..meta.len]).await {
                        log::debug!("Datagram {} -> {} dropped: {}", meta.peer, original_dst, e);
                    }
                }
                _ = reaper.tick() => {
                    let reaped = self.reap_idle();
                    if reaped > 0 {
                        log::debug!("Reaped {} idle UDP flows, {} remain", reaped, self.flow_count());
                    }
                }
                _ = shutdown_rx.recv() => {
                    log::info!("UDP forwarder stopping");
                    for (_, flow) in self.flows.take_all() {
                        close_flow(&flow);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Forward one intercepted datagram, opening its flow on first sight
    ///
    /// The datagram is queued for the flow's writer, so a slow client
    /// stream never holds up other flows. A full queue drops it.
    pub async fn handle_datagram(
        &self,
        peer: SocketAddrV4,
        original_dst: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()> {
        let key = FlowKey { peer, original_dst };
        let flow = match self.flows.get(&key) {
            Some(flow) => flow,
            None => self.open_flow(key).await?,
        };

        match flow.queue.try_send(payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Session(format!("UDP flow {} backlogged", key))),
            Err(TrySendError::Closed(_)) => {
                if let Some(flow) = self.flows.remove_if_same(&key, flow.id) {
                    close_flow(&flow);
                }
                Err(Error::Session(format!("UDP flow {} closed", key)))
            }
        }
    }

    async fn open_flow(&self, key: FlowKey) -> Result<Arc<UdpFlow>> {
        let vip = *key.original_dst.ip();
        let session = self.registry.get(vip).ok_or(Error::NoRoute(vip))?;

        let mut stream = timeout(self.write_timeout(), session.open_stream()).await??;
        let descriptor = FlowDescriptor::new(
            FlowProtocol::Udp,
            key.peer,
            self.config.flow_destination(key.original_dst),
        );
        let header = descriptor.encode()?;
        timeout(self.write_timeout(), async {
            stream.write_all(&header).await?;
            stream.flush().await
        })
        .await??;

        let (reader, writer) = tokio::io::split(stream);
        let (queue, pending) = mpsc::channel(FLOW_QUEUE_DEPTH);
        let last_active = Arc::new(AtomicU64::new(self.flows.now_ms()));

        // Both tasks remove the flow on exit, so they must not run ahead
        // of the insert.
        let mut entries = self.flows.entries.lock();
        let id = self.flows.next_id.fetch_add(1, Ordering::Relaxed);
        let link = FlowLink {
            key,
            id,
            flows: self.flows.clone(),
            session,
            last_active: last_active.clone(),
        };
        let reverse = tokio::spawn(relay_replies(reader, link.clone(), self.injector.clone()));
        tokio::spawn(write_datagrams(writer, pending, link, self.write_timeout()));

        let flow = Arc::new(UdpFlow {
            id,
            queue,
            last_active,
            reverse: reverse.abort_handle(),
        });
        if let Some(stale) = entries.insert(key, flow.clone()) {
            close_flow(&stale);
        }
        drop(entries);

        log::debug!("UDP flow {} opened", key);
        Ok(flow)
    }

    /// Close every flow idle for longer than the session timeout
    pub fn reap_idle(&self) -> usize {
        let expired = self.flows.take_idle(self.idle_timeout());
        let count = expired.len();
        for (key, flow) in expired {
            close_flow(&flow);
            log::debug!("UDP flow {} idle, closed", key);
        }
        count
    }
}

/// Stop the reply side; the writer shuts the stream once the queue drops
fn close_flow(flow: &UdpFlow) {
    flow.reverse.abort();
}

async fn recv_backoff(e: &io::Error) {
    log::warn!("UDP forwarder receive failed: {}", e);
    tokio::time::sleep(RECV_BACKOFF).await;
}

/// What the per-flow tasks share with the table entry
#[derive(Clone)]
struct FlowLink {
    key: FlowKey,
    id: u64,
    flows: Arc<FlowTable>,
    session: Arc<TunnelSession>,
    last_active: Arc<AtomicU64>,
}

impl FlowLink {
    fn close(&self, reason: &str) {
        if let Some(flow) = self.flows.remove_if_same(&self.key, self.id) {
            close_flow(&flow);
            log::debug!("UDP flow {} closed: {}", self.key, reason);
        }
    }
}

/// Drain queued datagrams onto the flow stream
async fn write_datagrams(
    mut writer: WriteHalf<StreamHandle>,
    mut pending: mpsc::Receiver<Vec<u8>>,
    link: FlowLink,
    write_timeout: Duration,
) {
    while let Some(payload) = pending.recv().await {
        match timeout(write_timeout, write_prefixed(&mut writer, &payload)).await {
            Ok(Ok(())) => {
                link.flows.touch(&link.last_active);
                link.session.record_tx(payload.len());
            }
            Ok(Err(e)) => {
                link.close(&e.to_string());
                break;
            }
            Err(_) => {
                link.close("write timed out");
                break;
            }
        }
    }
    let _ = timeout(write_timeout, writer.shutdown()).await;
}

/// Re-inject every reply the client sends back on a flow stream
async fn relay_replies(
    mut reader: ReadHalf<StreamHandle>,
    link: FlowLink,
    injector: Arc<dyn PacketInjector>,
) {
    let reason = match pump_replies(&mut reader, &link, injector.as_ref()).await {
        Ok(()) => "stream closed".to_string(),
        Err(e) => e.to_string(),
    };
    link.close(&reason);
}

async fn pump_replies(
    reader: &mut ReadHalf<StreamHandle>,
    link: &FlowLink,
    injector: &dyn PacketInjector,
) -> Result<()> {
    let key = link.key;
    loop {
        let payload = read_prefixed(reader).await?;
        link.session.record_rx(payload.len());
        let packet = match build_udp_packet(key.original_dst, key.peer, &payload) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Reply on UDP flow {} not sent: {}", key, e);
                continue;
            }
        };
        match injector.inject(&packet, key.peer) {
            Ok(_) => link.flows.touch(&link.last_active),
            Err(e) => log::warn!("Raw send to {} failed: {}", key.peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct RecordingInjector {
        sent: Mutex<Vec<(Vec<u8>, SocketAddrV4)>>,
    }

    impl PacketInjector for RecordingInjector {
        fn inject(&self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
            self.sent.lock().push((packet.to_vec(), dst));
            Ok(packet.len())
        }
    }

    fn config(session_timeout: u64) -> UdpForwardConfig {
        UdpForwardConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            target_ip: Ipv4Addr::LOCALHOST,
            preserve_destination: false,
            session_timeout,
            reap_interval: 1,
            write_timeout: 5,
        }
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5555)
    }

    fn dns_dst() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 10), 53)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_flow_key_display() {
        let key = FlowKey {
            peer: peer(),
            original_dst: dns_dst(),
        };
        assert_eq!(key.to_string(), "1.2.3.4:5555:100.64.0.10:53");
    }

    #[tokio::test]
    async fn test_first_datagram_opens_one_stream() {
        let mut tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let injector = Arc::new(RecordingInjector::default());
        let forwarder = UdpForwarder::new(registry, injector.clone(), config(30));

        forwarder.handle_datagram(peer(), dns_dst(), b"query-1").await.unwrap();
        forwarder.handle_datagram(peer(), dns_dst(), b"query-2").await.unwrap();
        assert_eq!(forwarder.flow_count(), 1);

        let mut stream = tunnel.inbound.recv().await.unwrap();
        let descriptor = FlowDescriptor::from_json(&read_prefixed(&mut stream).await.unwrap()).unwrap();
        assert_eq!(
            descriptor,
            FlowDescriptor {
                protocol: FlowProtocol::Udp,
                src_ip: "1.2.3.4".into(),
                src_port: "5555".into(),
                dst_ip: "127.0.0.1".into(),
                dst_port: "53".into(),
            }
        );
        assert_eq!(read_prefixed(&mut stream).await.unwrap(), b"query-1");
        assert_eq!(read_prefixed(&mut stream).await.unwrap(), b"query-2");
        assert!(tunnel.inbound.try_recv().is_err());

        // Replies come back as raw datagrams from the original destination
        write_prefixed(&mut stream, b"answer").await.unwrap();
        wait_until(|| !injector.sent.lock().is_empty()).await;
        let (packet, dst) = injector.sent.lock()[0].clone();
        assert_eq!(dst, peer());
        assert_eq!(packet, build_udp_packet(dns_dst(), peer(), b"answer").unwrap());

        assert_eq!(tunnel.session.take_counters(), (6, 14));
    }

    #[tokio::test]
    async fn test_distinct_peers_get_distinct_flows() {
        let mut tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let forwarder = UdpForwarder::new(registry, Arc::new(RecordingInjector::default()), config(30));

        let other = SocketAddrV4::new(Ipv4Addr::new(5, 6, 7, 8), 5555);
        forwarder.handle_datagram(peer(), dns_dst(), b"a").await.unwrap();
        forwarder.handle_datagram(other, dns_dst(), b"b").await.unwrap();
        assert_eq!(forwarder.flow_count(), 2);

        assert!(tunnel.inbound.recv().await.is_some());
        assert!(tunnel.inbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_datagram_without_session_dropped() {
        let forwarder = UdpForwarder::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(RecordingInjector::default()),
            config(30),
        );
        let result = forwarder.handle_datagram(peer(), dns_dst(), b"x").await;
        assert!(matches!(result, Err(Error::NoRoute(_))));
        assert_eq!(forwarder.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_flow_reaped_and_stream_closed() {
        let mut tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let forwarder = UdpForwarder::new(registry, Arc::new(RecordingInjector::default()), config(1));

        forwarder.handle_datagram(peer(), dns_dst(), b"ping").await.unwrap();
        let mut stream = tunnel.inbound.recv().await.unwrap();
        read_prefixed(&mut stream).await.unwrap();
        assert_eq!(read_prefixed(&mut stream).await.unwrap(), b"ping");

        assert_eq!(forwarder.reap_idle(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(forwarder.reap_idle(), 1);
        assert_eq!(forwarder.flow_count(), 0);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(n, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_reply_traffic_keeps_flow_alive() {
        let mut tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let injector = Arc::new(RecordingInjector::default());
        let forwarder = UdpForwarder::new(registry, injector.clone(), config(1));

        forwarder.handle_datagram(peer(), dns_dst(), b"subscribe").await.unwrap();
        let mut stream = tunnel.inbound.recv().await.unwrap();
        read_prefixed(&mut stream).await.unwrap();
        assert_eq!(read_prefixed(&mut stream).await.unwrap(), b"subscribe");

        // Only replies flow for longer than the idle timeout
        for _ in 0..8 {
            write_prefixed(&mut stream, b"update").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        wait_until(|| injector.sent.lock().len() == 8).await;

        assert_eq!(forwarder.reap_idle(), 0);
        assert_eq!(forwarder.flow_count(), 1);
    }

    #[tokio::test]
    async fn test_stalled_flow_does_not_delay_other_flows() {
        let mut tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let forwarder = UdpForwarder::new(registry, Arc::new(RecordingInjector::default()), config(30));

        // The client never reads this flow, so its stream window fills up
        let bulk = vec![0u8; 60_000];
        let dropped = tokio::time::timeout(Duration::from_secs(2), async {
            let mut dropped = 0;
            for _ in 0..FLOW_QUEUE_DEPTH + 16 {
                if forwarder.handle_datagram(peer(), dns_dst(), &bulk).await.is_err() {
                    dropped += 1;
                }
            }
            dropped
        })
        .await
        .unwrap();
        assert!(dropped > 0);
        let _stalled = tunnel.inbound.recv().await.unwrap();

        let other = SocketAddrV4::new(Ipv4Addr::new(5, 6, 7, 8), 4444);
        tokio::time::timeout(Duration::from_secs(2), forwarder.handle_datagram(other, dns_dst(), b"other"))
            .await
            .unwrap()
            .unwrap();

        let mut stream = tunnel.inbound.recv().await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), async {
            read_prefixed(&mut stream).await.unwrap();
            read_prefixed(&mut stream).await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(payload, b"other");
        assert_eq!(forwarder.flow_count(), 2);
    }

    #[tokio::test]
    async fn test_receive_error_backs_off() {
        let start = Instant::now();
        recv_backoff(&io::Error::other("socket gone")).await;
        assert!(start.elapsed() >= RECV_BACKOFF);
    }

    #[tokio::test]
    async fn test_flow_removed_when_tunnel_closes() {
        let tunnel = test_support::tunnel(*dns_dst().ip());
        let registry = Arc::new(SessionRegistry::new());
        registry.put(*dns_dst().ip(), tunnel.session.clone());
        let forwarder = UdpForwarder::new(registry, Arc::new(RecordingInjector::default()), config(30));

        forwarder.handle_datagram(peer(), dns_dst(), b"ping").await.unwrap();
        assert_eq!(forwarder.flow_count(), 1);

        tunnel.client.abort();
        wait_until(|| forwarder.flow_count() == 0).await;
    }
}
