//! Internet checksum and raw IPv4/UDP packet construction
//!
//! Replies to transparently intercepted UDP peers are sent through a raw
//! socket with `IP_HDRINCL`, so the kernel neither fills in nor verifies
//! either checksum. Everything here has to be right by construction.

use std::net::SocketAddrV4;

use crate::{Error, Result, MAX_UDP_PAYLOAD};

/// IPv4 header length without options
pub const IPV4_HDR_LEN: usize = 20;

/// UDP header length
pub const UDP_HDR_LEN: usize = 8;

const DEFAULT_TTL: u8 = 64;
const IPPROTO_UDP: u8 = 17;
const FLAG_DONT_FRAGMENT: u8 = 0x40;

/// Add `data` to a running sum as big-endian 16-bit words
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
pub fn checksum_add(data: &[u8], mut sum: u64) -> u64 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Fold carries back into 16 bits and take the one's complement
///
/// A result of zero is sent as `0xFFFF` (RFC 768).
pub fn checksum_fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    match !(sum as u16) {
        0 => 0xFFFF,
        csum => csum,
    }
}

/// One's-complement checksum of `data`
pub fn checksum(data: &[u8]) -> u16 {
    checksum_fold(checksum_add(data, 0))
}

/// Build an IPv4 datagram carrying `payload` from `src` to `dst`
///
/// The result is a 20-byte IPv4 header (DF set, TTL 64), an 8-byte UDP
/// header and the payload, with both checksums filled in.
pub fn build_udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    let total_len = (IPV4_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16;
    let udp_len = (UDP_HDR_LEN + payload.len()) as u16;
    let mut packet = vec![0u8; total_len as usize];

    // IPv4 header
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total_len.to_be_bytes());
    packet[6] = FLAG_DONT_FRAGMENT;
    packet[8] = DEFAULT_TTL;
    packet[9] = IPPROTO_UDP;
    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());

    // UDP header and payload
    let udp = &mut packet[IPV4_HDR_LEN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[UDP_HDR_LEN..].copy_from_slice(payload);

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.ip().octets());
    pseudo[4..8].copy_from_slice(&dst.ip().octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&udp_len.to_be_bytes());

    let udp_sum = checksum_fold(checksum_add(udp, checksum_add(&pseudo, 0)));
    udp[6..8].copy_from_slice(&udp_sum.to_be_bytes());

    let ip_sum = checksum(&packet[..IPV4_HDR_LEN]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    Ok(packet)
}
