//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Provides unified addressing for IP and local (Unix domain) transports.
//! Only literal forms are parsed here; name resolution is the resolver's job.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// An IPv4 or IPv6 address and port (IPv6 carries its scope identifier).
    Ip(SocketAddr),
    /// A local (Unix domain) socket path.
    #[cfg(unix)]
    Local(PathBuf),
}

impl Endpoint {
    /// Construct an IPv4 endpoint.
    #[must_use]
    pub fn v4(addr: Ipv4Addr, port: u16) -> Self {
        Self::Ip(SocketAddr::V4(SocketAddrV4::new(addr, port)))
    }

    /// Construct an IPv6 endpoint with no scope.
    #[must_use]
    pub fn v6(addr: Ipv6Addr, port: u16) -> Self {
        Self::Ip(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0)))
    }

    /// Construct an endpoint from any IP address and port.
    #[must_use]
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self::Ip(SocketAddr::new(addr, port))
    }

    /// Parse an endpoint from its canonical literal form.
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Returns true if this is an IPv4 endpoint.
    #[must_use]
    pub fn is_v4(&self) -> bool {
        matches!(self, Self::Ip(SocketAddr::V4(_)))
    }

    /// Returns true if this is an IPv6 endpoint.
    #[must_use]
    pub fn is_v6(&self) -> bool {
        matches!(self, Self::Ip(SocketAddr::V6(_)))
    }

    /// Returns true if this is a local endpoint.
    #[must_use]
    pub fn is_local(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, Self::Local(_))
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Return the IP address, if any.
    #[must_use]
    pub fn ip_addr(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(addr) => Some(addr.ip()),
            #[cfg(unix)]
            Self::Local(_) => None,
        }
    }

    /// Return the port, if any.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Ip(addr) => Some(addr.port()),
            #[cfg(unix)]
            Self::Local(_) => None,
        }
    }

    /// Return the socket address, failing for local endpoints.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::Ip(addr) => Ok(*addr),
            #[cfg(unix)]
            Self::Local(_) => Err(Error::NotSupported),
        }
    }

    /// Return the transport matching this endpoint family for stream sockets.
    #[must_use]
    pub fn stream_transport(&self) -> Transport {
        match self {
            Self::Ip(SocketAddr::V4(_)) => Transport::TcpIpv4Stream,
            Self::Ip(SocketAddr::V6(_)) => Transport::TcpIpv6Stream,
            #[cfg(unix)]
            Self::Local(_) => Transport::LocalStream,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }
        #[cfg(unix)]
        if s.starts_with('/') {
            return Ok(Self::Local(PathBuf::from(s)));
        }
        Err(Error::Invalid)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

/// Address family filter used by resolution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddressType {
    V4,
    V6,
}

/// Socket transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    TcpIpv4Stream,
    TcpIpv6Stream,
    UdpIpv4Datagram,
    UdpIpv6Datagram,
    #[cfg(unix)]
    LocalStream,
    #[cfg(unix)]
    LocalDatagram,
}

impl Transport {
    /// Returns true for the TCP stream transports.
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self, Self::TcpIpv4Stream | Self::TcpIpv6Stream)
    }

    /// Returns true for the UDP datagram transports.
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        matches!(self, Self::UdpIpv4Datagram | Self::UdpIpv6Datagram)
    }

    /// Returns true for the local (Unix domain) transports.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self, Self::LocalStream | Self::LocalDatagram)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Return the address family this transport requires, if any.
    #[must_use]
    pub const fn ip_address_type(&self) -> Option<IpAddressType> {
        match self {
            Self::TcpIpv4Stream | Self::UdpIpv4Datagram => Some(IpAddressType::V4),
            Self::TcpIpv6Stream | Self::UdpIpv6Datagram => Some(IpAddressType::V6),
            #[cfg(unix)]
            _ => None,
        }
    }
}
