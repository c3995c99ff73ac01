//! Interface record: the canonical representation of a configured network
//! interface (physical, bridge, vlan, or wireguard).

use serde::{Deserialize, Serialize};

use crate::wireguard::WireguardPeer;

/// Discriminates the four interface kinds the daemon manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Physical,
    Bridge,
    Vlan,
    Wireguard,
}

/// Protocol used to assign an address to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Static,
    Dhcp,
    None,
}

/// IPv6-specific sub-record, mirrored loosely on the IPv4 fields of
/// [`Interface`] but kept separate since dual-stack configuration is
/// optional per interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipv6Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_len: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// One configured interface. `name` is the map key under `interfaces` in the
/// jack config and is not itself a field of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(rename = "type")]
    pub kind: InterfaceType,

    pub device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipaddr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netmask: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridge_ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wg_private_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wg_listen_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wg_peers: Vec<WireguardPeer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_protocol() -> Protocol {
    Protocol::None
}

impl Interface {
    /// Whether this record requires `ipaddr` to be set.
    pub fn requires_ipaddr(&self) -> bool {
        matches!(self.protocol, Protocol::Static) && self.enabled
    }
}
