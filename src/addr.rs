//! Socket address union covering untyped, IPv4, and IPv6 forms.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

/// An address family bit, carried on connections and listeners
/// (`spec.md` §3, `Connection`/`Listener` invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// The address union from `spec.md` §6: untyped, generic IP, IPv4, or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// No address: used for connections that have not yet been told to
    /// bind anywhere in particular.
    Unspecified,
    V4 {
        addr: Ipv4Addr,
        port: u16,
    },
    V6 {
        addr: Ipv6Addr,
        port: u16,
        flow_info: u32,
        zone_id: u32,
    },
}

impl Address {
    /// A wildcard IPv4 address with the given port (`0` for OS-chosen).
    pub fn v4_wildcard(port: u16) -> Address {
        Address::V4 { addr: Ipv4Addr::UNSPECIFIED, port }
    }

    /// A wildcard IPv6 address with the given port.
    pub fn v6_wildcard(port: u16) -> Address {
        Address::V6 { addr: Ipv6Addr::UNSPECIFIED, port, flow_info: 0, zone_id: 0 }
    }

    pub fn family(&self) -> Option<Family> {
        match self {
            Address::Unspecified => None,
            Address::V4 { .. } => Some(Family::V4),
            Address::V6 { .. } => Some(Family::V6),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Unspecified => 0,
            Address::V4 { port, .. } => *port,
            Address::V6 { port, .. } => *port,
        }
    }

    /// Convert to `std::net::SocketAddr` for handing to the OS socket API.
    pub fn to_std(self) -> Result<SocketAddr, Error> {
        match self {
            Address::Unspecified => Err(Error::InvalidArg),
            Address::V4 { addr, port } => Ok(SocketAddr::V4(SocketAddrV4::new(addr, port))),
            Address::V6 { addr, port, flow_info, zone_id } => {
                Ok(SocketAddr::V6(SocketAddrV6::new(addr, port, flow_info, zone_id)))
            }
        }
    }

    pub fn from_std(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(a) => Address::V4 { addr: *a.ip(), port: a.port() },
            SocketAddr::V6(a) => Address::V6 {
                addr: *a.ip(),
                port: a.port(),
                flow_info: a.flowinfo(),
                zone_id: a.scope_id(),
            },
        }
    }
}

impl fmt::Display for Address {
    /// Renders `ddd.ddd.ddd.ddd:ppppp` or `[h...h%zone]:ppppp` per `spec.md` §6.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unspecified => write!(f, "<unspecified>"),
            Address::V4 { addr, port } => write!(f, "{addr}:{port}"),
            Address::V6 { addr, port, zone_id, .. } => {
                if *zone_id != 0 {
                    write!(f, "[{addr}%{zone_id}]:{port}")
                } else {
                    write!(f, "[{addr}]:{port}")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_display_matches_spec_format() {
        let a = Address::V4 { addr: Ipv4Addr::new(127, 0, 0, 1), port: 8080 };
        assert_eq!(a.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn v6_display_with_zone() {
        let a = Address::V6 { addr: Ipv6Addr::LOCALHOST, port: 53, flow_info: 0, zone_id: 2 };
        assert_eq!(a.to_string(), "[::1%2]:53");
    }

    #[test]
    fn v6_display_without_zone() {
        let a = Address::V6 { addr: Ipv6Addr::LOCALHOST, port: 53, flow_info: 0, zone_id: 0 };
        assert_eq!(a.to_string(), "[::1]:53");
    }

    #[test]
    fn unspecified_has_no_family_and_rejects_conversion() {
        assert_eq!(Address::Unspecified.family(), None);
        assert!(Address::Unspecified.to_std().is_err());
    }

    #[test]
    fn std_round_trip() {
        let std_addr: SocketAddr = "10.0.0.1:9".parse().unwrap();
        let addr = Address::from_std(std_addr);
        assert_eq!(addr.to_std().unwrap(), std_addr);
    }
}
