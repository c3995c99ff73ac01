// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Boot and auto-detection: on first run, with no
//! `interfaces.json` on disk, pick a WAN candidate out of the kernel's link
//! table and synthesize a minimal configuration rather than refusing to
//! start.

use std::collections::BTreeMap;

use jack_types::{Interface, InterfaceType, Protocol};
use serde_json::Value;
use tracing::info;

use crate::error::JackError;
use crate::netlink::{DetectedLink, NetlinkError, Platform};
use crate::persist::{self, Paths};

/// Kernel name prefixes that mark a link as virtual, never a WAN/LAN
/// candidate.
const VIRTUAL_NAME_PREFIXES: &[&str] = &["br", "veth", "docker", "tun", "dummy", "virbr", "lo"];

fn looks_virtual(link: &DetectedLink) -> bool {
    if link.is_loopback {
        return true;
    }
    VIRTUAL_NAME_PREFIXES
        .iter()
        .any(|prefix| link.name.starts_with(prefix))
}

/// Run first-run auto-detection if `$JACK_CONFIG_DIR/interfaces.json` is
/// absent, persisting a synthesized document and returning it. Returns
/// `Ok(None)` when `interfaces.json` already exists (auto-detect does not
/// run).
pub async fn first_run<P: Platform>(platform: &P, paths: &Paths) -> Result<Option<Value>, JackError> {
    if persist::load_json(&paths.interfaces_json()).await?.is_some() {
        return Ok(None);
    }

    info!("no interfaces.json found, running first-run auto-detection");
    let links = platform.list_candidate_links().await.map_err(kernel_error)?;
    let wan_name = choose_wan(&links)?;
    let wan_link = links.iter().find(|l| l.name == wan_name).expect("choose_wan returns a listed name");

    let interface = synthesize_interface(wan_link);
    let mut interfaces = BTreeMap::new();
    interfaces.insert(wan_name.clone(), interface);

    let document = serde_json::to_value(&interfaces).expect("interface map always serializes");
    persist::save_json(&paths.interfaces_json(), &document).await?;
    info!(interface = %wan_name, "synthesized interfaces.json from auto-detection");

    Ok(Some(document))
}

/// Prefer the interface carrying a default route; else the
/// first (lexicographic) interface with an assigned IP; else the first
/// lexicographic physical candidate. Fails if no candidate exists at all.
fn choose_wan(links: &[DetectedLink]) -> Result<String, JackError> {
    let mut candidates: Vec<&DetectedLink> = links.iter().filter(|l| !looks_virtual(l)).collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    if let Some(link) = candidates.iter().find(|l| l.has_default_route) {
        return Ok(link.name.clone());
    }
    if let Some(link) = candidates.iter().find(|l| l.ipaddr.is_some()) {
        return Ok(link.name.clone());
    }
    candidates
        .first()
        .map(|l| l.name.clone())
        .ok_or_else(|| JackError::Kernel {
            target: "boot auto-detect".to_string(),
            reason: "no physical interface candidates found in kernel link table".to_string(),
        })
}

/// Preserve any currently-assigned IP by choosing `protocol=static` with
/// that IP; otherwise fall back to DHCP.
fn synthesize_interface(link: &DetectedLink) -> Interface {
    let (protocol, ipaddr, netmask) = match (&link.ipaddr, &link.netmask) {
        (Some(ip), Some(mask)) => (Protocol::Static, ip.clone(), mask.clone()),
        _ => (Protocol::Dhcp, String::new(), String::new()),
    };

    Interface {
        kind: InterfaceType::Physical,
        device: link.name.clone(),
        device_name: None,
        protocol,
        enabled: true,
        ipaddr,
        netmask,
        gateway: String::new(),
        mtu: None,
        mac: None,
        bridge_ports: Vec::new(),
        vlan_id: None,
        wg_private_key: None,
        wg_listen_port: None,
        wg_peers: Vec::new(),
        ipv6: None,
        comment: Some("synthesized by first-run auto-detection".to_string()),
    }
}

fn kernel_error(e: NetlinkError) -> JackError {
    JackError::Kernel {
        target: "boot auto-detect".to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str, loopback: bool, default_route: bool, ip: Option<&str>) -> DetectedLink {
        DetectedLink {
            name: name.to_string(),
            is_loopback: loopback,
            has_default_route: default_route,
            ipaddr: ip.map(|s| s.to_string()),
            netmask: ip.map(|_| "255.255.255.0".to_string()),
        }
    }

    #[test]
    fn filters_loopback_and_virtual_prefixes() {
        let links = vec![
            link("lo", true, false, None),
            link("br-docker0", false, false, None),
            link("veth123abc", false, false, None),
            link("eth0", false, false, Some("10.0.0.5")),
        ];
        assert_eq!(choose_wan(&links).unwrap(), "eth0");
    }

    #[test]
    fn prefers_default_route_owner() {
        let links = vec![
            link("eth0", false, false, Some("10.0.0.5")),
            link("eth1", false, true, None),
        ];
        assert_eq!(choose_wan(&links).unwrap(), "eth1");
    }

    #[test]
    fn falls_back_to_interface_with_ip_when_no_default_route() {
        let links = vec![
            link("eth1", false, false, None),
            link("eth0", false, false, Some("10.0.0.5")),
        ];
        assert_eq!(choose_wan(&links).unwrap(), "eth0");
    }

    #[test]
    fn falls_back_to_lexicographic_first_physical() {
        let links = vec![link("eth1", false, false, None), link("eth0", false, false, None)];
        assert_eq!(choose_wan(&links).unwrap(), "eth0");
    }

    #[test]
    fn no_candidates_fails() {
        let links = vec![link("lo", true, false, None)];
        assert!(choose_wan(&links).is_err());
    }

    #[tokio::test]
    async fn synthesizes_static_interface_preserving_assigned_ip() {
        use crate::netlink::mock::MockPlatform;

        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: dir.path().to_path_buf(),
            socket_path: dir.path().join("jack.sock"),
        };
        let platform = MockPlatform::with_candidate_links(vec![link("eth0", false, true, Some("192.168.1.20"))]);

        let document = first_run(&platform, &paths).await.unwrap().expect("ran auto-detection");
        assert_eq!(document["eth0"]["protocol"], "static");
        assert_eq!(document["eth0"]["ipaddr"], "192.168.1.20");

        // Second call is a no-op since interfaces.json now exists.
        assert!(first_run(&platform, &paths).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synthesizes_dhcp_interface_without_assigned_ip() {
        use crate::netlink::mock::MockPlatform;

        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: dir.path().to_path_buf(),
            socket_path: dir.path().join("jack.sock"),
        };
        let platform = MockPlatform::with_candidate_links(vec![link("eth0", false, false, None)]);

        let document = first_run(&platform, &paths).await.unwrap().expect("ran auto-detection");
        assert_eq!(document["eth0"]["protocol"], "dhcp");
    }
}
