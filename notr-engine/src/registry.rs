//! Session registry: VIP to established tunnel session
//!
//! The tunnel server is the only writer. Forwarders and the overlay relay
//! read it to find the session that owns a destination VIP and open new
//! streams on it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notr_protocol::Frame;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_yamux::{Control, StreamHandle};

use crate::error::{Error, Result};

/// One authenticated client tunnel
pub struct TunnelSession {
    vip: Ipv4Addr,
    domain: String,
    peer: SocketAddr,
    control: Control,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    overlay: Mutex<Option<(u64, mpsc::Sender<Frame>)>>,
    overlay_generation: AtomicU64,
}

impl TunnelSession {
    pub fn new(vip: Ipv4Addr, domain: impl Into<String>, peer: SocketAddr, control: Control) -> Self {
        Self {
            vip,
            domain: domain.into(),
            peer,
            control,
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            overlay: Mutex::new(None),
            overlay_generation: AtomicU64::new(0),
        }
    }

    pub fn vip(&self) -> Ipv4Addr {
        self.vip
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Open a new stream towards the client
    ///
    /// Fails once the underlying connection is gone.
    pub async fn open_stream(&self) -> Result<StreamHandle> {
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| Error::Session(format!("open stream to {}: {}", self.vip, e)))
    }

    /// Count bytes received from the client
    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count bytes sent to the client
    pub fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read and reset the byte counters, returning `(rx, tx)`
    pub fn take_counters(&self) -> (u64, u64) {
        (
            self.rx_bytes.swap(0, Ordering::Relaxed),
            self.tx_bytes.swap(0, Ordering::Relaxed),
        )
    }

    /// Attach the overlay channel sender, replacing any earlier one
    ///
    /// Returns a token that detaches only this attachment.
    pub fn attach_overlay(&self, tx: mpsc::Sender<Frame>) -> u64 {
        let generation = self.overlay_generation.fetch_add(1, Ordering::Relaxed) + 1;
        *self.overlay.lock() = Some((generation, tx));
        generation
    }

    pub fn detach_overlay(&self, generation: u64) {
        let mut overlay = self.overlay.lock();
        if matches!(overlay.as_ref(), Some((current, _)) if *current == generation) {
            overlay.take();
        }
    }

    /// Queue an overlay packet for the client
    ///
    /// Returns `false` when no overlay channel is attached or its queue is
    /// full; the packet is dropped in both cases.
    pub fn send_overlay(&self, packet: Vec<u8>) -> bool {
        let overlay = self.overlay.lock();
        match overlay.as_ref() {
            Some((_, tx)) => tx.try_send(Frame::data(packet)).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("vip", &self.vip)
            .field("domain", &self.domain)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Process-wide map from VIP to session
///
/// Performs no I/O; each call takes the internal lock once.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Ipv4Addr, Arc<TunnelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under `vip`, returning any entry it displaced
    pub fn put(&self, vip: Ipv4Addr, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        self.sessions.write().insert(vip, session)
    }

    pub fn get(&self, vip: Ipv4Addr) -> Option<Arc<TunnelSession>> {
        self.sessions.read().get(&vip).cloned()
    }

    pub fn delete(&self, vip: Ipv4Addr) -> Option<Arc<TunnelSession>> {
        self.sessions.write().remove(&vip)
    }

    /// Remove `session` if it is still the entry for its VIP
    pub fn remove_session(&self, session: &Arc<TunnelSession>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.vip()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.vip());
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, vip: Ipv4Addr) -> bool {
        self.sessions.read().contains_key(&vip)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of registered sessions
    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.read().values().cloned().collect()
    }
}
