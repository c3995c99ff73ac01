//! Syntactic predicates over IP addresses, CIDRs, netmasks, MACs, ports.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// `true` if `s` parses as an IPv4 or IPv6 address.
pub fn is_valid_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// `true` if `s` parses as `addr/prefix` (either family).
pub fn is_valid_cidr(s: &str) -> bool {
    s.parse::<IpNetwork>().is_ok()
}

/// `true` if `s` is a dotted-decimal IPv4 netmask (e.g. `255.255.255.0`).
/// Contiguous-ones masks only — a netmask with scattered bits is rejected.
pub fn is_valid_netmask(s: &str) -> bool {
    let Ok(IpAddr::V4(addr)) = s.parse::<IpAddr>() else {
        return false;
    };
    let bits = u32::from(addr);
    // A valid netmask is some number of leading ones followed by zeros:
    // !bits + 1 is a power of two (or bits is all-ones / all-zeros).
    let inverted = !bits;
    inverted == 0 || (inverted & (inverted + 1)) == 0
}

/// `true` if `s` is a colon-separated 6-octet MAC address.
pub fn is_valid_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// `true` if `port` is in the valid TCP/UDP port range (1..=65535).
pub fn is_valid_port(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// `true` if `mtu` is within the Linux-accepted MTU window.
pub fn is_valid_mtu(mtu: u32) -> bool {
    (68..=65536).contains(&mtu)
}

/// `true` if `id` is a valid 802.1Q VLAN id.
pub fn is_valid_vlan_id(id: u16) -> bool {
    (1..=4094).contains(&id)
}

/// `true` if `name` is an acceptable kernel interface name: non-empty, at
/// most 15 bytes (`IFNAMSIZ - 1`), no `/` or whitespace.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| !c.is_whitespace() && c != '/' && c != '\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("255.255.255.0", true)]
    #[test_case("255.255.255.255", true)]
    #[test_case("0.0.0.0", true)]
    #[test_case("255.255.0.255", false; "scattered bits")]
    #[test_case("not-an-ip", false)]
    fn netmask(input: &str, expected: bool) {
        assert_eq!(is_valid_netmask(input), expected);
    }

    #[test_case(67, false; "below minimum")]
    #[test_case(68, true; "minimum")]
    #[test_case(1500, true)]
    #[test_case(65536, true; "maximum")]
    #[test_case(65537, false; "above maximum")]
    fn mtu(input: u32, expected: bool) {
        assert_eq!(is_valid_mtu(input), expected);
    }

    #[test_case(0, false)]
    #[test_case(1, true)]
    #[test_case(4094, true)]
    #[test_case(4095, false)]
    fn vlan_id(input: u16, expected: bool) {
        assert_eq!(is_valid_vlan_id(input), expected);
    }

    #[test_case("aa:bb:cc:dd:ee:ff", true)]
    #[test_case("aa:bb:cc:dd:ee", false; "too short")]
    #[test_case("zz:bb:cc:dd:ee:ff", false; "non hex")]
    fn mac(input: &str, expected: bool) {
        assert_eq!(is_valid_mac(input), expected);
    }

    #[test]
    fn cidr_accepts_v4_and_v6() {
        assert!(is_valid_cidr("10.0.0.0/24"));
        assert!(is_valid_cidr("fd00::/64"));
        assert!(!is_valid_cidr("10.0.0.0"));
    }
}
