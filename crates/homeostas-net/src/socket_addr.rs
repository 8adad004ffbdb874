// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Address parsing and interface enumeration (`socket_addr`, C8).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Classification predicates over a parsed address, grounded on the same
/// loopback/link-local/global split `hdds`'s transport layer uses to decide
/// which interfaces to bind and announce.
pub trait AddressClass {
    fn is_loopback(&self) -> bool;
    fn is_link_local(&self) -> bool;
    fn is_site_local(&self) -> bool;
    fn is_wildcard(&self) -> bool;
    /// None of the above: reachable from the public Internet.
    fn is_global(&self) -> bool {
        !(self.is_loopback() || self.is_link_local() || self.is_site_local() || self.is_wildcard())
    }
}

impl AddressClass for IpAddr {
    fn is_loopback(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_loopback(),
            IpAddr::V6(a) => a.is_loopback(),
        }
    }

    fn is_link_local(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_link_local(),
            IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    fn is_site_local(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_private(),
            IpAddr::V6(a) => (a.segments()[0] & 0xfe00) == 0xfc00,
        }
    }

    fn is_wildcard(&self) -> bool {
        match self {
            IpAddr::V4(a) => a.is_unspecified(),
            IpAddr::V6(a) => a.is_unspecified(),
        }
    }
}

impl AddressClass for SocketAddr {
    fn is_loopback(&self) -> bool {
        self.ip().is_loopback()
    }
    fn is_link_local(&self) -> bool {
        self.ip().is_link_local()
    }
    fn is_site_local(&self) -> bool {
        self.ip().is_site_local()
    }
    fn is_wildcard(&self) -> bool {
        self.ip().is_wildcard()
    }
}

/// List the host's non-loopback, non-link-local interface addresses
/// (`original_source` keeps a platform-probed interface list; here grounded
/// on `local-ip-address`'s portable enumeration, as `hdds`'s multicast
/// transport falls back to the same crate on non-Linux platforms).
pub fn enumerate_interfaces() -> Vec<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces
            .into_iter()
            .map(|(_name, ip)| ip)
            .filter(|ip| !ip.is_loopback() && !ip.is_link_local())
            .collect(),
        Err(e) => {
            log::debug!("failed to list network interfaces: {e}");
            Vec::new()
        }
    }
}

/// Split an interface list into global (publicly reachable) and private
/// addresses (§4.3 "Public address inference").
pub fn partition_global(addrs: Vec<IpAddr>) -> (Vec<IpAddr>, Vec<IpAddr>) {
    addrs.into_iter().partition(|a| a.is_global())
}

pub fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
}

pub fn v6(segments: [u16; 8], port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(segments)), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_not_global() {
        let a: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert!(a.is_loopback());
        assert!(!a.is_global());
    }

    #[test]
    fn private_v4_is_not_global() {
        let a: SocketAddr = "192.168.1.5:1234".parse().unwrap();
        assert!(a.is_site_local());
        assert!(!a.is_global());
    }

    #[test]
    fn public_v4_is_global() {
        let a: SocketAddr = "8.8.8.8:53".parse().unwrap();
        assert!(a.is_global());
    }

    #[test]
    fn parse_format_roundtrip() {
        for s in ["203.0.113.9:4242", "0.0.0.0:0", "[2001:db8::1]:80"] {
            let parsed: SocketAddr = s.parse().unwrap();
            let formatted = parsed.to_string();
            let reparsed: SocketAddr = formatted.parse().unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn wildcard_is_not_global() {
        let a: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert!(a.is_wildcard());
        assert!(!a.is_global());
    }
}
