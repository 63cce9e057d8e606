//! TCP utilities.
//!
//! Address resolution for listen/bind requests and `TCP_NODELAY` on an
//! already connected compio stream.
//!
//! # Safety
//!
//! Setting options on a compio stream borrows its raw file descriptor. The
//! unsafe block is contained in [`enable_tcp_nodelay`].

#![allow(unsafe_code)]

use socket2::Socket;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// Resolve `host:port` to its first address. An empty host means the IPv4
/// wildcard.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    if host.is_empty() {
        return Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)));
    }
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

/// Enable TCP_NODELAY on a compio TcpStream for minimal latency.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { Socket::from_raw_fd(fd) };
        let result = sock.set_nodelay(true);
        std::mem::forget(sock); // Don't close the fd
        result
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { Socket::from_raw_socket(raw) };
        let result = sock.set_nodelay(true);
        std::mem::forget(sock); // Don't close the socket
        result
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = stream;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_is_wildcard() {
        let addr = resolve("", 9000).unwrap();
        assert_eq!(addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn numeric_host_resolves() {
        let addr = resolve("127.0.0.1", 28221).unwrap();
        assert_eq!(addr, "127.0.0.1:28221".parse::<SocketAddr>().unwrap());
    }
}
