//! Compact binary encoding of UDP peer addresses.
//!
//! Every datagram handed to a service is prefixed with the sender's address
//! so the service can answer with `send_to`. Layout:
//!
//! ```text
//! '4' | 4 address bytes  | 2 port bytes (big-endian)   = 7 bytes
//! '6' | 16 address bytes | 2 port bytes (big-endian)   = 19 bytes
//! ```

use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ADDR_V4_SIZE: usize = 1 + 4 + 2;
pub const ADDR_V6_SIZE: usize = 1 + 16 + 2;

/// Inline storage large enough for either form.
pub type EncodedAddr = SmallVec<[u8; ADDR_V6_SIZE]>;

#[must_use]
pub fn encode_address(addr: &SocketAddr) -> EncodedAddr {
    let mut out = EncodedAddr::new();
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(b'4');
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(b'6');
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode an address from the start of `bytes`.
///
/// Returns the address and the number of bytes it occupied, or `None` when
/// the tag is unknown or the input is short.
#[must_use]
pub fn decode_address(bytes: &[u8]) -> Option<(SocketAddr, usize)> {
    match bytes.first()? {
        b'4' if bytes.len() >= ADDR_V4_SIZE => {
            let ip: [u8; 4] = bytes[1..5].try_into().ok()?;
            let port = u16::from_be_bytes([bytes[5], bytes[6]]);
            Some((SocketAddr::new(Ipv4Addr::from(ip).into(), port), ADDR_V4_SIZE))
        }
        b'6' if bytes.len() >= ADDR_V6_SIZE => {
            let ip: [u8; 16] = bytes[1..17].try_into().ok()?;
            let port = u16::from_be_bytes([bytes[17], bytes[18]]);
            Some((SocketAddr::new(Ipv6Addr::from(ip).into(), port), ADDR_V6_SIZE))
        }
        _ => None,
    }
}
