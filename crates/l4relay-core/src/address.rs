//! Endpoint address parsing
//!
//! Endpoints are written as `ip:port`, where `ip` is an IPv4 dotted-quad or
//! empty (meaning every local interface) and `port` is a decimal integer.

use crate::error::AddressError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A resolved (IPv4, port) pair, fixed for the lifetime of the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress(SocketAddrV4);

impl EndpointAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .split_once(':')
            .ok_or_else(|| AddressError::MissingSeparator(s.to_string()))?;

        if port.is_empty() {
            return Err(AddressError::MissingPort(s.to_string()));
        }

        // u16::from_str would accept a leading '+'
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressError::InvalidPort {
                address: s.to_string(),
                port: port.to_string(),
            });
        }
        let port: u16 = port.parse().map_err(|_| AddressError::InvalidPort {
            address: s.to_string(),
            port: port.to_string(),
        })?;

        let ip = if host.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            host.parse::<Ipv4Addr>()
                .map_err(|_| AddressError::InvalidHost {
                    address: s.to_string(),
                    host: host.to_string(),
                })?
        };

        Ok(Self::new(ip, port))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddrV4> for EndpointAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl From<EndpointAddress> for SocketAddr {
    fn from(addr: EndpointAddress) -> Self {
        addr.socket_addr()
    }
}
