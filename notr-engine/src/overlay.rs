//! Overlay packet relay between a local device and client tunnels
//!
//! Clients open one stream on their tunnel for overlay traffic. Frames on
//! it use the same `[version][command][len][body]` framing as the control
//! handshake: `data` frames carry raw IP packets, `heartbeat` frames are
//! echoed back. Packets read from the device are routed to the session
//! owning their IPv4 destination.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use notr_protocol::{read_frame, write_frame, Command, Frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::registry::{SessionRegistry, TunnelSession};

/// Interface buffer size
pub const IFACE_BUFSIZE: usize = 2000;

const OVERLAY_QUEUE: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Local network interface carrying overlay traffic
#[async_trait::async_trait]
pub trait OverlayDevice: Send + Sync {
    /// Read one packet
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// Destination of an IPv4 packet, or `None` for anything else
pub fn extract_dst_ipv4(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 {
        return None;
    }

    let version = packet[0] >> 4;
    if version != 4 {
        return None;
    }

    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Read packets from the device and queue each one on its owner's channel
pub async fn run_device_reader(
    device: Arc<dyn OverlayDevice>,
    registry: Arc<SessionRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; IFACE_BUFSIZE];
    loop {
        tokio::select! {
            read = device.recv(&mut buf) => {
                let n = read?;
                let Some(dst) = extract_dst_ipv4(&buf[..n]) else {
                    continue;
                };
                match registry.get(dst) {
                    Some(session) => {
                        if session.send_overlay(buf[..n].to_vec()) {
                            session.record_tx(n);
                        } else {
                            log::debug!("Overlay queue for {} unavailable, dropping {} bytes", dst, n);
                        }
                    }
                    None => log::debug!("No session for overlay destination {}", dst),
                }
            }
            _ = shutdown_rx.recv() => {
                log::info!("Overlay device reader stopping");
                return Ok(());
            }
        }
    }
}

/// Serve one client-opened overlay stream until it closes or misbehaves
pub async fn serve_overlay_stream<S>(
    stream: S,
    session: Arc<TunnelSession>,
    device: Arc<dyn OverlayDevice>,
    read_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Frame>(OVERLAY_QUEUE);
    let generation = session.attach_overlay(tx.clone());

    let write_loop = async {
        while let Some(frame) = rx.recv().await {
            timeout(WRITE_TIMEOUT, write_frame(&mut writer, &frame)).await??;
        }
        Ok::<(), Error>(())
    };

    let read_loop = pump_inbound(&mut reader, &session, device.as_ref(), &tx, read_timeout);

    let result = tokio::select! {
        r = write_loop => r,
        r = read_loop => r,
    };
    session.detach_overlay(generation);
    result
}

async fn pump_inbound<R>(
    reader: &mut R,
    session: &TunnelSession,
    device: &dyn OverlayDevice,
    replies: &mpsc::Sender<Frame>,
    read_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = timeout(read_timeout, read_frame(reader)).await??;
        match frame.command {
            Command::Data => {
                session.record_rx(frame.body.len());
                if let Err(e) = device.send(&frame.body).await {
                    log::warn!("Overlay device write failed: {}", e);
                }
            }
            Command::Heartbeat => {
                let _ = replies.try_send(Frame::heartbeat());
            }
            Command::Auth => {
                return Err(notr_protocol::Error::UnexpectedCommand(Command::Auth).into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_dst_ipv4() {
        // Minimal IPv4 packet header (20 bytes)
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[16] = 100;
        packet[17] = 64;
        packet[18] = 0;
        packet[19] = 9;

        let dst = extract_dst_ipv4(&packet);
        assert_eq!(dst, Some(Ipv4Addr::new(100, 64, 0, 9)));
    }

    #[test]
    fn test_extract_dst_ipv4_too_short() {
        let packet = vec![0u8; 10];
        assert_eq!(extract_dst_ipv4(&packet), None);
    }

    #[test]
    fn test_extract_dst_ipv4_wrong_version() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x60;
        assert_eq!(extract_dst_ipv4(&packet), None);
    }
}
