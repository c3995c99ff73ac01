//! Syntactic validation of an [`Interface`] record.
//! Kernel-state invariants (vlan parent exists, bridge ports exist) are
//! apply-time checks owned by the netlink reconciler, not this module.

use jack_types::{Interface, InterfaceType, Protocol};

use crate::error::ValidationError;
use crate::net::{
    is_valid_cidr, is_valid_interface_name, is_valid_ip, is_valid_mac, is_valid_mtu,
    is_valid_netmask, is_valid_port, is_valid_vlan_id,
};
use crate::wireguard::is_valid_key_shape;

pub fn validate_interface(name: &str, iface: &Interface) -> Result<(), ValidationError> {
    if !is_valid_interface_name(name) {
        return Err(ValidationError::field("name", "invalid interface name"));
    }

    if iface.requires_ipaddr() && iface.ipaddr.is_empty() {
        return Err(ValidationError::field(
            "ipaddr",
            "required when protocol=static and enabled=true",
        ));
    }

    if !iface.ipaddr.is_empty() && !is_valid_ip(&iface.ipaddr) {
        return Err(ValidationError::field("ipaddr", "not a valid IP address"));
    }

    if !iface.netmask.is_empty() && !is_valid_netmask(&iface.netmask) {
        return Err(ValidationError::field("netmask", "not a valid netmask"));
    }

    if !iface.gateway.is_empty() && !is_valid_ip(&iface.gateway) {
        return Err(ValidationError::field(
            "gateway",
            "not a valid IP address",
        ));
    }

    if let Some(mtu) = iface.mtu
        && !is_valid_mtu(mtu)
    {
        return Err(ValidationError::field("mtu", "out of range (68..65536)"));
    }

    if let Some(mac) = &iface.mac
        && !is_valid_mac(mac)
    {
        return Err(ValidationError::field("mac", "not a valid MAC address"));
    }

    match iface.kind {
        InterfaceType::Vlan => {
            let id = iface
                .vlan_id
                .ok_or_else(|| ValidationError::field("vlan_id", "required for vlan interfaces"))?;
            if !is_valid_vlan_id(id) {
                return Err(ValidationError::field("vlan_id", "out of range (1..4094)"));
            }
        }
        InterfaceType::Bridge => {
            for port in &iface.bridge_ports {
                if !is_valid_interface_name(port) {
                    return Err(ValidationError::field(
                        "bridge_ports",
                        format!("invalid port name {port:?}"),
                    ));
                }
            }
        }
        InterfaceType::Wireguard => validate_wireguard_fields(iface)?,
        InterfaceType::Physical => {}
    }

    validate_protocol(iface.protocol)?;

    Ok(())
}

fn validate_protocol(_protocol: Protocol) -> Result<(), ValidationError> {
    // Protocol is a closed enum decoded by serde; an unknown string fails
    // deserialization before it ever reaches here. Kept as an explicit stage
    // so future protocol variants are validated in one place.
    Ok(())
}

fn validate_wireguard_fields(iface: &Interface) -> Result<(), ValidationError> {
    if let Some(key) = &iface.wg_private_key
        && !is_valid_key_shape(key)
    {
        return Err(ValidationError::field(
            "wg_private_key",
            "not a 32-byte base64 key",
        ));
    }

    if let Some(port) = iface.wg_listen_port
        && !is_valid_port(port as u32)
    {
        return Err(ValidationError::field("wg_listen_port", "out of range"));
    }

    for (i, peer) in iface.wg_peers.iter().enumerate() {
        if !is_valid_key_shape(&peer.public_key) {
            return Err(ValidationError::field(
                format!("wg_peers[{i}].public_key"),
                "not a 32-byte base64 key",
            ));
        }
        if let Some(psk) = &peer.preshared_key
            && !is_valid_key_shape(psk)
        {
            return Err(ValidationError::field(
                format!("wg_peers[{i}].preshared_key"),
                "not a 32-byte base64 key",
            ));
        }
        if peer.allowed_ips.is_empty() {
            return Err(ValidationError::field(
                format!("wg_peers[{i}].allowed_ips"),
                "must be non-empty",
            ));
        }
        for cidr in &peer.allowed_ips {
            if !is_valid_cidr(cidr) {
                return Err(ValidationError::field(
                    format!("wg_peers[{i}].allowed_ips"),
                    format!("{cidr:?} is not a valid CIDR"),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    fn physical(ipaddr: &str, enabled: bool, protocol: Protocol) -> Interface {
        Interface {
            kind: InterfaceType::Physical,
            device: "eth0".into(),
            device_name: None,
            protocol,
            enabled,
            ipaddr: ipaddr.into(),
            netmask: String::new(),
            gateway: String::new(),
            mtu: None,
            mac: None,
            bridge_ports: vec![],
            vlan_id: None,
            wg_private_key: None,
            wg_listen_port: None,
            wg_peers: vec![],
            ipv6: None,
            comment: None,
        }
    }

    #[test]
    fn static_enabled_requires_ipaddr() {
        let iface = physical("", true, Protocol::Static);
        assert!(validate_interface("eth0", &iface).is_err());
    }

    #[test]
    fn dhcp_does_not_require_ipaddr() {
        let iface = physical("", true, Protocol::Dhcp);
        assert!(validate_interface("eth0", &iface).is_ok());
    }

    #[test]
    fn vlan_id_out_of_range_rejected() {
        let mut iface = physical("10.0.0.1", true, Protocol::Static);
        iface.kind = InterfaceType::Vlan;
        iface.device = "eth0".into();
        iface.vlan_id = Some(4095);
        assert!(validate_interface("vlan0", &iface).is_err());
    }

    #[test]
    fn zero_port_bridge_is_valid() {
        let mut iface = physical("10.0.0.1", true, Protocol::Static);
        iface.kind = InterfaceType::Bridge;
        iface.bridge_ports = vec![];
        assert!(validate_interface("br0", &iface).is_ok());
    }

    #[test]
    fn wireguard_peer_requires_allowed_ips() {
        let mut iface = physical("10.0.0.1", true, Protocol::Static);
        iface.kind = InterfaceType::Wireguard;
        iface.wg_peers = vec![jack_types::WireguardPeer {
            public_key: STANDARD.encode([1u8; 32]),
            preshared_key: None,
            endpoint: None,
            allowed_ips: vec![],
            persistent_keepalive: None,
        }];
        assert!(validate_interface("wg0", &iface).is_err());
    }
}
