//! Transparent-proxy and raw sockets for the forwarders
//!
//! Host firewall rules steer traffic addressed to client VIPs into the
//! forwarder listeners with TPROXY. The listeners need `IP_TRANSPARENT` to
//! accept it, and the UDP listener also enables `IP_RECVORIGDSTADDR` so each
//! datagram arrives with its pre-interception destination in a control
//! message. UDP replies go out through a raw socket with `IP_HDRINCL`,
//! which keeps the hand-built IPv4 header intact.
//!
//! All of this needs `CAP_NET_ADMIN` (raw sockets need `CAP_NET_RAW`).

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

#[cfg(unix)]
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use crate::error::{Error, Result};

const LISTEN_BACKLOG: i32 = 1024;

/// Sends fully built IPv4 datagrams
pub trait PacketInjector: Send + Sync {
    /// Transmit `packet` (IPv4 header included) towards `dst`
    fn inject(&self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize>;
}

/// Enable an integer IP-level socket option
#[cfg(target_os = "linux")]
fn enable_ip_option(socket: &Socket, name: libc::c_int, option: &'static str) -> Result<()> {
    let optval: libc::c_int = 1;
    // SAFETY: fd is a live socket owned by `socket`; optval outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_IP,
            name,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::Socket {
            option,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_ip_option(_socket: &Socket, _name: i32, option: &'static str) -> Result<()> {
    Err(Error::Socket {
        option,
        source: io::Error::new(io::ErrorKind::Unsupported, "transparent proxying requires Linux"),
    })
}

#[cfg(target_os = "linux")]
const IP_TRANSPARENT: libc::c_int = libc::IP_TRANSPARENT;
#[cfg(target_os = "linux")]
const IP_RECVORIGDSTADDR: libc::c_int = libc::IP_RECVORIGDSTADDR;
#[cfg(target_os = "linux")]
const IP_HDRINCL: libc::c_int = libc::IP_HDRINCL;

#[cfg(not(target_os = "linux"))]
const IP_TRANSPARENT: i32 = 19;
#[cfg(not(target_os = "linux"))]
const IP_RECVORIGDSTADDR: i32 = 20;
#[cfg(not(target_os = "linux"))]
const IP_HDRINCL: i32 = 3;

fn ipv4_only(addr: SocketAddr) -> Result<()> {
    if addr.is_ipv4() {
        Ok(())
    } else {
        Err(Error::Config(format!("{}: forwarders are IPv4 only", addr)))
    }
}

/// Bind a TCP listener that accepts TPROXY-redirected connections
///
/// Each accepted connection's local address is its original destination.
pub fn tproxy_tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    ipv4_only(addr)?;
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    enable_ip_option(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// A received datagram with its addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    /// Number of payload bytes
    pub len: usize,
    /// Sender of the datagram
    pub peer: SocketAddrV4,
    /// Destination before interception; `None` when the kernel supplied no
    /// usable control message
    pub original_dst: Option<SocketAddrV4>,
}

/// UDP socket receiving TPROXY-redirected datagrams
pub struct TproxyUdpSocket {
    socket: UdpSocket,
}

impl TproxyUdpSocket {
    /// Bind with `IP_TRANSPARENT` and `IP_RECVORIGDSTADDR` enabled
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        ipv4_only(addr)?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        enable_ip_option(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;
        enable_ip_option(&socket, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram together with its original destination
    #[cfg(target_os = "linux")]
    pub async fn recv_original(&self, buf: &mut [u8]) -> io::Result<RecvMeta> {
        use nix::sys::socket::{recvmsg, MsgFlags, SockaddrIn, SockaddrStorage};
        use std::io::IoSliceMut;

        let fd = self.socket.as_raw_fd();

        loop {
            self.socket.readable().await?;

            let mut iov = [IoSliceMut::new(buf)];
            let mut cmsg_buf = nix::cmsg_space!(libc::sockaddr_in);

            #[allow(unreachable_patterns)] // EAGAIN == EWOULDBLOCK on some platforms
            let result = self.socket.try_io(tokio::io::Interest::READABLE, || {
                match recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
                    Ok(msg) => {
                        let peer = msg
                            .address
                            .and_then(|sa: SockaddrStorage| {
                                let sin: Option<&SockaddrIn> = sa.as_sockaddr_in();
                                sin.map(|s| SocketAddrV4::new(s.ip(), s.port()))
                            })
                            .ok_or_else(|| io::Error::other("datagram without IPv4 source"))?;

                        let original_dst = if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
                            None
                        } else {
                            msg.cmsgs().ok().and_then(original_dst_from_cmsgs)
                        };

                        Ok(RecvMeta {
                            len: msg.bytes,
                            peer,
                            original_dst,
                        })
                    }
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EWOULDBLOCK) => {
                        Err(io::Error::from(io::ErrorKind::WouldBlock))
                    }
                    Err(e) => Err(io::Error::other(e)),
                }
            });

            match result {
                Ok(meta) => return Ok(meta),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn recv_original(&self, _buf: &mut [u8]) -> io::Result<RecvMeta> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "original destination delivery requires Linux",
        ))
    }
}

/// Pull the `IP_ORIGDSTADDR` control message out of a received message
#[cfg(target_os = "linux")]
pub fn original_dst_from_cmsgs<I>(cmsgs: I) -> Option<SocketAddrV4>
where
    I: IntoIterator<Item = nix::sys::socket::ControlMessageOwned>,
{
    use nix::sys::socket::ControlMessageOwned;

    cmsgs.into_iter().find_map(|cmsg| match cmsg {
        ControlMessageOwned::Ipv4OrigDstAddr(addr) => Some(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        )),
        _ => None,
    })
}

/// Raw IPv4 socket with `IP_HDRINCL`
pub struct RawSocketInjector {
    socket: Socket,
}

impl RawSocketInjector {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(raw_protocol())))?;
        enable_ip_option(&socket, IP_HDRINCL, "IP_HDRINCL")?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

#[cfg(unix)]
fn raw_protocol() -> i32 {
    libc::IPPROTO_RAW
}

#[cfg(not(unix))]
fn raw_protocol() -> i32 {
    255
}

impl PacketInjector for RawSocketInjector {
    fn inject(&self, packet: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(packet, &SockAddr::from(SocketAddr::V4(dst)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_original_dst_from_cmsgs() {
        use nix::sys::socket::ControlMessageOwned;

        // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 53u16.to_be();
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::new(100, 64, 0, 10)).to_be();

        let cmsgs = vec![ControlMessageOwned::Ipv4OrigDstAddr(addr)];
        assert_eq!(
            original_dst_from_cmsgs(cmsgs),
            Some(SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 10), 53))
        );
        assert_eq!(original_dst_from_cmsgs(Vec::new()), None);
    }

    #[test]
    fn test_ipv6_listener_rejected() {
        let result = tproxy_tcp_listener("[::1]:0".parse().unwrap());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires root privileges"]
    async fn test_tproxy_udp_bind() {
        let socket = TproxyUdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    #[ignore = "requires root privileges"]
    async fn test_tproxy_tcp_bind() {
        let listener = tproxy_tcp_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    #[ignore = "requires root privileges"]
    fn test_raw_injector_open() {
        assert!(RawSocketInjector::new().is_ok());
    }
}
