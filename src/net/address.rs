// src/net/address.rs - Dual-stack endpoint value type
//
// Every address is canonicalized to its IPv6 form (IPv4 becomes v4-mapped),
// so one AF_INET6 socket with V6ONLY disabled serves both families and
// equality is byte-exact over the canonical representation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// An IPv6-canonicalized (host, port) pair.
///
/// A zero port is a *computable* placeholder: the owning socket will ask the
/// OS via getsockname on the next `Socket::address()` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketAddress {
    host: Ipv6Addr,
    port: u16,
}

impl SocketAddress {
    /// Wildcard (unspecified) address, port 0 unless set.
    pub const fn wildcard() -> SocketAddress {
        SocketAddress {
            host: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// Loopback address with the given port.
    pub fn loopback(port: u16) -> SocketAddress {
        SocketAddress {
            host: Ipv4Addr::LOCALHOST.to_ipv6_mapped(),
            port,
        }
    }

    pub fn new(host: IpAddr, port: u16) -> SocketAddress {
        let host = match host {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        SocketAddress { host, port }
    }

    pub fn host(&self) -> Ipv6Addr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(mut self, port: u16) -> SocketAddress {
        self.port = port;
        self
    }

    /// True when host or port carries information (mirrors the "is set" test
    /// used before computing an address lazily).
    pub fn is_set(&self) -> bool {
        self.port != 0 || !self.host.is_unspecified()
    }

    /// The std form, v4-unmapped where possible (nicer in logs).
    pub fn to_std(&self) -> SocketAddr {
        match self.host.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.host), self.port),
        }
    }

    /// The canonical AF_INET6 form handed to the OS.
    pub fn to_v6(&self) -> SocketAddrV6 {
        SocketAddrV6::new(self.host, self.port, 0, 0)
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> SocketAddress {
        SocketAddress::new(addr.ip(), addr.port())
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> SocketAddr {
        addr.to_std()
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_std())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_and_mapped_v6_are_equal() {
        let v4: SocketAddress = "127.0.0.1:1935".parse::<SocketAddr>().unwrap().into();
        let mapped: SocketAddress = "[::ffff:127.0.0.1]:1935"
            .parse::<SocketAddr>()
            .unwrap()
            .into();
        assert_eq!(v4, mapped);
    }

    #[test]
    fn test_distinct_ports_differ() {
        let a = SocketAddress::loopback(1935);
        let b = SocketAddress::loopback(1936);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wildcard_is_not_set() {
        assert!(!SocketAddress::wildcard().is_set());
        assert!(SocketAddress::wildcard().with_port(80).is_set());
        assert!(SocketAddress::loopback(0).is_set());
    }

    #[test]
    fn test_display_unmaps_v4() {
        let addr = SocketAddress::loopback(1935);
        assert_eq!(addr.to_string(), "127.0.0.1:1935");
    }

    #[test]
    fn test_std_round_trip() {
        let std: SocketAddr = "[2001:db8::1]:554".parse().unwrap();
        let addr: SocketAddress = std.into();
        assert_eq!(addr.to_std(), std);
    }
}
