//! Notr Protocol Implementation
//!
//! Building blocks shared by the notr tunnel broker and its clients:
//!
//! - [`Frame`]: the `[version][command][len][body]` control/data framing
//!   used on the tunnel connection and the overlay channel
//! - [`AuthRequest`] / [`AuthReply`]: JSON bodies of the `auth` exchange
//! - [`FlowDescriptor`]: the length-prefixed JSON header written first on
//!   every TCP/UDP forwarding stream
//! - [`VipPool`]: virtual IP allocation from a CIDR block
//! - [`build_udp_packet`]: hand-built IPv4/UDP datagrams for raw socket
//!   re-injection
//!
//! ```rust
//! use notr_protocol::{Command, Frame};
//!
//! let frame = Frame::data(vec![0x45, 0x00, 0x00, 0x14]);
//! let wire = frame.encode().unwrap();
//! let decoded = Frame::decode(&wire).unwrap();
//! assert_eq!(decoded.command, Command::Data);
//! assert_eq!(decoded.body, frame.body);
//! ```

mod checksum;
mod error;
mod frame;
mod message;
mod pool;

pub use checksum::{build_udp_packet, checksum, checksum_add, checksum_fold, IPV4_HDR_LEN, UDP_HDR_LEN};
pub use error::{Error, Result};
pub use frame::{
    read_frame, read_prefixed, write_frame, write_prefixed, Command, Frame, FrameHeader,
    FRAME_HDR_LEN, MAX_BODY_LEN,
};
pub use message::{AuthReply, AuthRequest, FlowDescriptor, FlowProtocol};
pub use pool::VipPool;

/// Protocol version written into every frame header
pub const PROTO_VERSION: u8 = 0x01;

/// Largest UDP payload that fits a single IPv4 datagram without options
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize - IPV4_HDR_LEN - UDP_HDR_LEN;
