//! Socket address helpers.
//!
//! Dual-stack sockets deliver IPv4 peers as v4-mapped IPv6 addresses. The
//! path table keys on native addresses, so everything that enters it goes
//! through [`unmap`] first and equality checks then reduce to plain `==`.

use std::net::{IpAddr, SocketAddr};

/// Rewrite a v4-mapped IPv6 address as native IPv4; other addresses pass
/// through unchanged.
pub fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// [`unmap_ip`] for a full socket address, preserving the port.
pub fn unmap(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(unmap_ip(addr.ip()), addr.port())
}

/// Whether two IP addresses belong to the same address family.
pub fn same_family(a: IpAddr, b: IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn unmaps_v4_mapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.2]:5000".parse().unwrap();
        let native = unmap(mapped);
        assert_eq!(native.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(native.port(), 5000);
    }

    #[test]
    fn leaves_native_addresses_alone() {
        let v4: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(unmap(v4), v4);
        assert_eq!(unmap(v6), v6);
    }

    #[test]
    fn mapped_and_native_compare_equal_after_unmap() {
        let mapped: SocketAddr = "[::ffff:192.0.2.7]:9".parse().unwrap();
        let native: SocketAddr = "192.0.2.7:9".parse().unwrap();
        assert_eq!(unmap(mapped), native);
    }

    #[test]
    fn family_check() {
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(same_family(v4, v4));
        assert!(same_family(v6, v6));
        assert!(!same_family(v4, v6));
    }
}
