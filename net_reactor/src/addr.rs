// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs,
};

use nix::sys::socket::{AddressFamily, SockaddrStorage};

use crate::Error;

/// A tagged IPv4/IPv6 endpoint.
///
/// This is a thin wrapper over `std::net::SocketAddr`; the engine converts to
/// and from the kernel's sockaddr forms only at the system call boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    /// Constructs an endpoint with the given port on the wildcard address, or
    /// on the loopback address if `loopback_only` is set. Mostly used for
    /// listening sockets.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> Self {
        let ip: IpAddr = match (ipv6, loopback_only) {
            (false, false) => Ipv4Addr::UNSPECIFIED.into(),
            (false, true) => Ipv4Addr::LOCALHOST.into(),
            (true, false) => Ipv6Addr::UNSPECIFIED.into(),
            (true, true) => Ipv6Addr::LOCALHOST.into(),
        };
        InetAddr(SocketAddr::new(ip, port))
    }

    /// Constructs an endpoint from a numeric IP string like "1.2.3.4" or
    /// "fe80::1" and a port.
    pub fn from_ip_port(ip: &str, port: u16) -> Result<Self, Error> {
        let ip: IpAddr = ip.parse()?;
        Ok(InetAddr(SocketAddr::new(ip, port)))
    }

    /// Resolves a hostname to a single endpoint, blocking the calling thread.
    /// The first address returned by the resolver wins; the port of the
    /// result is 0.
    pub fn resolve(hostname: &str) -> Result<Self, Error> {
        let mut addrs = (hostname, 0u16).to_socket_addrs()?;
        match addrs.next() {
            Some(addr) => Ok(InetAddr(addr)),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {hostname}"),
            ))),
        }
    }

    pub fn ip(&self) -> String {
        self.0.ip().to_string()
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.0.ip(), self.0.port())
    }

    /// Port in host byte order.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn family(&self) -> AddressFamily {
        match self.0 {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub(crate) fn from_storage(storage: &SockaddrStorage) -> Option<Self> {
        if let Some(sin) = storage.as_sockaddr_in() {
            let addr = SocketAddrV4::new(sin.ip(), sin.port());
            return Some(InetAddr(SocketAddr::V4(addr)));
        }
        if let Some(sin6) = storage.as_sockaddr_in6() {
            let addr = SocketAddrV6::new(sin6.ip(), sin6.port(), sin6.flowinfo(), sin6.scope_id());
            return Some(InetAddr(SocketAddr::V6(addr)));
        }
        None
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0.ip(), self.0.port())
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        InetAddr(addr)
    }
}

impl From<InetAddr> for SocketAddr {
    fn from(addr: InetAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_and_loopback_construction() {
        let any = InetAddr::new(7000, false, false);
        assert_eq!(any.ip_port(), "0.0.0.0:7000");
        assert_eq!(any.port(), 7000);
        assert_eq!(any.family(), AddressFamily::Inet);

        let local6 = InetAddr::new(53, true, true);
        assert_eq!(local6.ip(), "::1");
        assert_eq!(local6.family(), AddressFamily::Inet6);
    }

    #[test]
    fn numeric_parse_and_display() {
        let addr = InetAddr::from_ip_port("192.168.1.9", 8080).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.9:8080");

        assert!(InetAddr::from_ip_port("not-an-ip", 1).is_err());
    }

    #[test]
    fn resolve_localhost() {
        let addr = InetAddr::resolve("localhost").unwrap();
        assert!(addr.socket_addr().ip().is_loopback());
    }
}
