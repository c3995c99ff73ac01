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

//! Netlink reconciler: apply interfaces and routes to the
//! kernel, capture/restore snapshots.
//!
//! Interfaces are applied in dependency order — physical, then vlan, then
//! bridge. WireGuard interfaces are deliberately excluded from this list:
//! WireGuard peer configuration is performed by the wireguard
//! provider plugin, not this module; the reconciler only needs to know
//! which interface names are WireGuard-kind so the apply pipeline can hand
//! them to that plugin (see `pipeline::apply`).

use std::collections::BTreeMap;
use std::future::Future;

use jack_types::{Interface, InterfaceType, Protocol, Route};
use thiserror::Error;
use tracing::{debug, info, warn};

use jack_types::checkpoint::{InterfaceSnapshot, RouteSnapshot, SystemSnapshot};

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("interface {0} not found in kernel")]
    InterfaceNotFound(String),

    #[error("bridge port {port} (for bridge {bridge}) not found in kernel")]
    BridgePortNotFound { bridge: String, port: String },

    #[error("vlan parent {parent} (for vlan {vlan}) not found in kernel")]
    VlanParentNotFound { vlan: String, parent: String },

    #[error("netlink request failed: {0}")]
    Netlink(String),

    #[error("address parse error: {0}")]
    AddrParse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstraction over kernel interaction so the reconciler's ordering and
/// idempotence logic can be exercised without a real kernel, covering
/// every interface kind plus routes and snapshots.
pub trait Platform: Send + Sync {
    fn link_exists(&self, name: &str) -> impl Future<Output = Result<bool, NetlinkError>> + Send;

    fn ensure_bridge(&self, name: &str) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn ensure_vlan(
        &self,
        name: &str,
        parent: &str,
        vlan_id: u16,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn set_master(
        &self,
        port: &str,
        bridge: Option<&str>,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Names of the links currently enslaved to `bridge` in the kernel,
    /// regardless of what the committed config says — `apply_bridge` diffs
    /// this against the configured port list to release stale members.
    fn bridge_members(&self, bridge: &str) -> impl Future<Output = Result<Vec<String>, NetlinkError>> + Send;

    /// Apply MTU, MAC, addresses, and up/down state, skipping attributes
    /// that already match the kernel.
    fn apply_link_attrs(
        &self,
        name: &str,
        iface: &Interface,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn spawn_dhcp_client(&self, name: &str) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn apply_route(&self, route: &Route) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn delete_route(&self, route: &Route) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    fn enable_ipv4_forwarding(&self) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Current state of `/proc/sys/net/ipv4/ip_forward`, surfaced in `info`
    ///.
    fn ipv4_forwarding_enabled(&self) -> impl Future<Output = Result<bool, NetlinkError>> + Send;

    fn capture_snapshot(&self) -> impl Future<Output = Result<SystemSnapshot, NetlinkError>> + Send;

    fn restore_snapshot(
        &self,
        snapshot: &SystemSnapshot,
        scopes: &[&str],
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;

    /// Enumerate kernel links for first-run auto-detection: every link the kernel knows about, regardless of whether any
    /// configured interface references it.
    fn list_candidate_links(&self) -> impl Future<Output = Result<Vec<DetectedLink>, NetlinkError>> + Send;
}

/// One kernel link as seen during boot auto-detection, before it is
/// filtered down to WAN/LAN candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedLink {
    pub name: String,
    pub is_loopback: bool,
    pub has_default_route: bool,
    pub ipaddr: Option<String>,
    pub netmask: Option<String>,
}

/// Apply every interface in `interfaces`, in physical -> vlan -> bridge
/// order. Returns the names of WireGuard-kind interfaces skipped (owned by
/// the wireguard plugin instead).
pub async fn apply_interfaces<P: Platform>(
    platform: &P,
    interfaces: &BTreeMap<String, Interface>,
) -> Result<Vec<String>, NetlinkError> {
    let mut wireguard_owned = Vec::new();

    for (name, iface) in ordered(interfaces, InterfaceType::Physical) {
        apply_physical(platform, name, iface).await?;
    }
    for (name, iface) in ordered(interfaces, InterfaceType::Vlan) {
        apply_vlan(platform, name, iface).await?;
    }
    for (name, iface) in ordered(interfaces, InterfaceType::Bridge) {
        apply_bridge(platform, name, iface).await?;
    }
    for (name, _) in ordered(interfaces, InterfaceType::Wireguard) {
        wireguard_owned.push(name.clone());
    }

    Ok(wireguard_owned)
}

/// Deterministic (name-sorted) iteration over interfaces of one kind. The
/// caller's map is already a `BTreeMap`, but we re-filter per kind so the
/// overall order honors the dependency direction regardless of how the
/// types happen to interleave alphabetically.
fn ordered(
    interfaces: &BTreeMap<String, Interface>,
    kind: InterfaceType,
) -> impl Iterator<Item = (&String, &Interface)> {
    interfaces.iter().filter(move |(_, i)| i.kind == kind)
}

async fn apply_physical<P: Platform>(
    platform: &P,
    name: &str,
    iface: &Interface,
) -> Result<(), NetlinkError> {
    let kernel_name = iface.device_name.as_deref().unwrap_or(&iface.device);
    if !platform.link_exists(kernel_name).await? {
        return Err(NetlinkError::InterfaceNotFound(kernel_name.to_string()));
    }

    platform.apply_link_attrs(kernel_name, iface).await?;

    match iface.protocol {
        Protocol::Dhcp => {
            debug!(interface = name, "spawning dhcp client");
            platform.spawn_dhcp_client(kernel_name).await?;
        }
        Protocol::Static | Protocol::None => {}
    }

    info!(interface = name, kernel_name, "applied physical interface");
    Ok(())
}

async fn apply_vlan<P: Platform>(
    platform: &P,
    name: &str,
    iface: &Interface,
) -> Result<(), NetlinkError> {
    let kernel_name = iface.device_name.as_deref().unwrap_or(name);
    let vlan_id = iface
        .vlan_id
        .expect("vlan_id presence checked by jack-validate before apply");

    if !platform.link_exists(&iface.device).await? {
        return Err(NetlinkError::VlanParentNotFound {
            vlan: name.to_string(),
            parent: iface.device.clone(),
        });
    }

    if !platform.link_exists(kernel_name).await? {
        platform.ensure_vlan(kernel_name, &iface.device, vlan_id).await?;
    }

    platform.apply_link_attrs(kernel_name, iface).await?;
    info!(interface = name, kernel_name, vlan_id, "applied vlan interface");
    Ok(())
}

async fn apply_bridge<P: Platform>(
    platform: &P,
    name: &str,
    iface: &Interface,
) -> Result<(), NetlinkError> {
    let kernel_name = iface.device_name.as_deref().unwrap_or(name);

    for port in &iface.bridge_ports {
        if !platform.link_exists(port).await? {
            return Err(NetlinkError::BridgePortNotFound {
                bridge: name.to_string(),
                port: port.clone(),
            });
        }
    }

    if !platform.link_exists(kernel_name).await? {
        platform.ensure_bridge(kernel_name).await?;
    }

    let current_members = platform.bridge_members(kernel_name).await?;
    for stale in current_members.iter().filter(|m| !iface.bridge_ports.contains(m)) {
        debug!(bridge = name, port = stale, "releasing stale bridge port");
        platform.set_master(stale, None).await?;
    }

    for port in &iface.bridge_ports {
        platform.set_master(port, Some(kernel_name)).await?;
    }

    platform.apply_link_attrs(kernel_name, iface).await?;
    info!(
        interface = name,
        kernel_name,
        port_count = iface.bridge_ports.len(),
        "applied bridge interface"
    );
    Ok(())
}

/// Apply every enabled, non-default route, then install default routes
/// derived from interfaces' `gateway` fields, then delete disabled routes
/// that are still present in the kernel.
pub async fn apply_routes<P: Platform>(
    platform: &P,
    routes: &BTreeMap<String, Route>,
    interfaces: &BTreeMap<String, Interface>,
) -> Result<(), NetlinkError> {
    for (name, route) in routes {
        if !route.enabled {
            debug!(route = name, "deleting disabled route");
            platform.delete_route(route).await?;
            continue;
        }
        if route.is_default() {
            continue;
        }
        platform.apply_route(route).await?;
    }

    for (name, iface) in interfaces {
        if iface.enabled && !iface.gateway.is_empty() {
            let default_route = Route {
                destination: Route::DEFAULT_DESTINATION.to_string(),
                gateway: iface.gateway.clone(),
                interface: Some(iface.device_name.clone().unwrap_or(iface.device.clone())),
                metric: 0,
                table: 0,
                enabled: true,
            };
            debug!(interface = name, gateway = %iface.gateway, "installing default route");
            platform.apply_route(&default_route).await?;
        }
    }

    Ok(())
}

/// A reconciler instance bound to a concrete [`Platform`]; this is the type
/// that the apply pipeline and observer hold onto.
pub struct Reconciler<P: Platform> {
    platform: P,
}

impl<P: Platform> Reconciler<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub async fn apply_interfaces(
        &self,
        interfaces: &BTreeMap<String, Interface>,
    ) -> Result<Vec<String>, NetlinkError> {
        apply_interfaces(&self.platform, interfaces).await
    }

    pub async fn apply_routes(
        &self,
        routes: &BTreeMap<String, Route>,
        interfaces: &BTreeMap<String, Interface>,
    ) -> Result<(), NetlinkError> {
        apply_routes(&self.platform, routes, interfaces).await
    }

    pub async fn enable_ipv4_forwarding(&self) -> Result<(), NetlinkError> {
        self.platform.enable_ipv4_forwarding().await
    }

    pub async fn capture_snapshot(&self) -> Result<SystemSnapshot, NetlinkError> {
        self.platform.capture_snapshot().await
    }

    pub async fn restore_snapshot(
        &self,
        snapshot: &SystemSnapshot,
        scopes: &[&str],
    ) -> Result<(), NetlinkError> {
        warn!(scopes = ?scopes, "restoring system snapshot after failed apply");
        self.platform.restore_snapshot(snapshot, scopes).await
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use std::future::Future;
    use std::net::IpAddr;

    use futures::TryStreamExt;
    use tracing::{debug, info};

    use jack_types::{Interface, Route};

    use super::{NetlinkError, Platform};
    use jack_types::checkpoint::{InterfaceSnapshot, RouteSnapshot, SystemSnapshot};

    /// The real, Linux-only implementation, built directly on `rtnetlink`
    /// for address, link-state, bridge, vlan, and route management.
    pub struct LinuxPlatform;

    impl LinuxPlatform {
        async fn handle() -> Result<rtnetlink::Handle, NetlinkError> {
            let (conn, handle, _) =
                rtnetlink::new_connection().map_err(NetlinkError::Io)?;
            tokio::spawn(conn);
            Ok(handle)
        }

        async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<Option<u32>, NetlinkError> {
            let mut links = handle.link().get().match_name(name.to_string()).execute();
            match links
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                Some(link) => Ok(Some(link.header.index)),
                None => Ok(None),
            }
        }
    }

    impl Platform for LinuxPlatform {
        async fn link_exists(&self, name: &str) -> Result<bool, NetlinkError> {
            let handle = Self::handle().await?;
            Ok(Self::link_index(&handle, name).await?.is_some())
        }

        async fn ensure_bridge(&self, name: &str) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            handle
                .link()
                .add(rtnetlink::LinkBridge::new(name).build())
                .execute()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            info!(interface = name, "created bridge link");
            Ok(())
        }

        async fn ensure_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            let parent_index = Self::link_index(&handle, parent)
                .await?
                .ok_or_else(|| NetlinkError::InterfaceNotFound(parent.to_string()))?;
            handle
                .link()
                .add(rtnetlink::LinkVlan::new(name, parent_index, vlan_id).build())
                .execute()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            info!(interface = name, parent, vlan_id, "created vlan link");
            Ok(())
        }

        async fn set_master(&self, port: &str, bridge: Option<&str>) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            let port_index = Self::link_index(&handle, port)
                .await?
                .ok_or_else(|| NetlinkError::InterfaceNotFound(port.to_string()))?;

            let msg = match bridge {
                Some(bridge_name) => {
                    let bridge_index = Self::link_index(&handle, bridge_name)
                        .await?
                        .ok_or_else(|| NetlinkError::InterfaceNotFound(bridge_name.to_string()))?;
                    rtnetlink::LinkUnspec::new_with_index(port_index)
                        .controller(bridge_index)
                        .build()
                }
                None => rtnetlink::LinkUnspec::new_with_index(port_index)
                    .nocontroller()
                    .build(),
            };

            handle
                .link()
                .set(msg)
                .execute()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            debug!(port, bridge = ?bridge, "set bridge master");
            Ok(())
        }

        async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>, NetlinkError> {
            let handle = Self::handle().await?;
            let bridge_index = Self::link_index(&handle, bridge)
                .await?
                .ok_or_else(|| NetlinkError::InterfaceNotFound(bridge.to_string()))?;

            let mut links = handle.link().get().execute();
            let mut members = Vec::new();
            while let Some(link) = links
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                let controller = link.attributes.iter().find_map(|a| match a {
                    rtnetlink::packet_route::link::LinkAttribute::Controller(idx) => Some(*idx),
                    _ => None,
                });
                if controller != Some(bridge_index) {
                    continue;
                }
                if let Some(name) = link.attributes.iter().find_map(|a| match a {
                    rtnetlink::packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                }) {
                    members.push(name);
                }
            }
            Ok(members)
        }

        async fn apply_link_attrs(&self, name: &str, iface: &Interface) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            let index = Self::link_index(&handle, name)
                .await?
                .ok_or_else(|| NetlinkError::InterfaceNotFound(name.to_string()))?;

            if let Some(mtu) = iface.mtu {
                let msg = rtnetlink::LinkUnspec::new_with_index(index).mtu(mtu).build();
                handle
                    .link()
                    .set(msg)
                    .execute()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            }

            if iface.protocol == jack_types::Protocol::Static && !iface.ipaddr.is_empty() {
                let prefix = netmask_to_prefix(&iface.netmask).unwrap_or(32);
                let addr: IpAddr = iface
                    .ipaddr
                    .parse()
                    .map_err(|_| NetlinkError::AddrParse(iface.ipaddr.clone()))?;

                let existing: Vec<_> = handle
                    .address()
                    .get()
                    .set_link_index_filter(index)
                    .execute()
                    .try_collect()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
                for addr_msg in existing {
                    handle
                        .address()
                        .del(addr_msg)
                        .execute()
                        .await
                        .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
                }

                handle
                    .address()
                    .add(index, addr, prefix)
                    .execute()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            }

            let msg = if iface.enabled {
                rtnetlink::LinkUnspec::new_with_index(index).up().build()
            } else {
                rtnetlink::LinkUnspec::new_with_index(index).down().build()
            };
            handle
                .link()
                .set(msg)
                .execute()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?;

            Ok(())
        }

        async fn spawn_dhcp_client(&self, name: &str) -> Result<(), NetlinkError> {
            // The core daemon only hands the link off; the actual DHCP
            // client process is a subprocess concern, not netlink.
            tokio::process::Command::new("dhclient")
                .arg(name)
                .spawn()
                .map_err(NetlinkError::Io)?;
            Ok(())
        }

        async fn apply_route(&self, route: &Route) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            let (dest, prefix): (IpAddr, u8) = if route.is_default() {
                ("0.0.0.0".parse().unwrap(), 0)
            } else {
                super::parse_cidr(&route.destination)
                    .map_err(|e| NetlinkError::AddrParse(e.to_string()))?
            };

            let mut req = handle.route().add().v4();
            if let IpAddr::V4(v4) = dest {
                req = req.destination_prefix(v4, prefix);
            }
            if !route.gateway.is_empty()
                && let Ok(IpAddr::V4(gw)) = route.gateway.parse::<IpAddr>()
            {
                req = req.gateway(gw);
            }
            req = req.table_id(if route.table == 0 { 254 } else { route.table });

            req.execute()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            Ok(())
        }

        async fn delete_route(&self, route: &Route) -> Result<(), NetlinkError> {
            let handle = Self::handle().await?;
            let (dest, prefix) = if route.is_default() {
                ("0.0.0.0".parse().unwrap(), 0)
            } else {
                super::parse_cidr(&route.destination).map_err(|e| NetlinkError::AddrParse(e.to_string()))?
            };
            let table = if route.table == 0 { 254 } else { route.table };

            let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
            while let Some(msg) = routes
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                if !route_matches(&msg, dest, prefix, table) {
                    continue;
                }
                handle
                    .route()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?;
            }
            Ok(())
        }

        async fn enable_ipv4_forwarding(&self) -> Result<(), NetlinkError> {
            tokio::fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")
                .await
                .map_err(NetlinkError::Io)?;
            Ok(())
        }

        async fn capture_snapshot(&self) -> Result<SystemSnapshot, NetlinkError> {
            let handle = Self::handle().await?;
            let mut links = handle.link().get().execute();
            let mut interfaces = Vec::new();
            let mut names_by_index: std::collections::BTreeMap<u32, String> = std::collections::BTreeMap::new();
            while let Some(link) = links
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                let name = link
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                names_by_index.insert(link.header.index, name.clone());
                let mtu = link.attributes.iter().find_map(|a| match a {
                    rtnetlink::packet_route::link::LinkAttribute::Mtu(m) => Some(*m),
                    _ => None,
                });

                let mut addr_stream = handle
                    .address()
                    .get()
                    .set_link_index_filter(link.header.index)
                    .execute();
                let mut addresses = Vec::new();
                while let Some(addr_msg) = addr_stream
                    .try_next()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?
                {
                    for attr in &addr_msg.attributes {
                        if let rtnetlink::packet_route::address::AddressAttribute::Address(ip) = attr {
                            addresses.push(format!("{ip}/{}", addr_msg.header.prefix_len));
                        }
                    }
                }

                interfaces.push(InterfaceSnapshot {
                    name,
                    existed: true,
                    kind: None,
                    mtu,
                    up: link.header.flags.contains(rtnetlink::packet_route::link::LinkFlags::Up),
                    addresses,
                });
            }

            let mut route_stream = handle.route().get(rtnetlink::IpVersion::V4).execute();
            let mut routes = Vec::new();
            while let Some(msg) = route_stream
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                let destination = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::route::RouteAttribute::Destination(d) => {
                            Some(format!("{d}/{}", msg.header.destination_prefix_length))
                        }
                        _ => None,
                    })
                    .unwrap_or_else(|| "default".to_string());
                let gateway = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::route::RouteAttribute::Gateway(g) => Some(g.to_string()),
                        _ => None,
                    })
                    .unwrap_or_default();
                let interface = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::route::RouteAttribute::Oif(idx) => names_by_index.get(idx).cloned(),
                        _ => None,
                    });
                let table = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::route::RouteAttribute::Table(t) => Some(*t),
                        _ => None,
                    })
                    .unwrap_or(msg.header.table as u32);

                routes.push(RouteSnapshot {
                    destination,
                    gateway,
                    interface,
                    metric: 0,
                    table,
                });
            }

            Ok(SystemSnapshot { interfaces, routes })
        }

        /// Best-effort restore: for each interface the snapshot says existed,
        /// re-create any address it had but the kernel currently lacks,
        /// delete any address the kernel now has that the snapshot doesn't,
        /// and reset MTU and up/down state. Interfaces the snapshot never
        /// saw (created mid-apply) are left untouched, and routes present in
        /// the snapshot are re-installed if missing.
        async fn restore_snapshot(
            &self,
            snapshot: &SystemSnapshot,
            scopes: &[&str],
        ) -> Result<(), NetlinkError> {
            debug!(scopes = ?scopes, count = snapshot.interfaces.len(), "restoring snapshot");
            let handle = Self::handle().await?;

            if scopes.contains(&"interfaces") {
                for iface in &snapshot.interfaces {
                    if !iface.existed {
                        continue;
                    }
                    let Some(index) = Self::link_index(&handle, &iface.name).await? else {
                        // Interface vanished entirely; nothing to restore it into.
                        continue;
                    };

                    if let Some(mtu) = iface.mtu {
                        let msg = rtnetlink::LinkUnspec::new_with_index(index).mtu(mtu).build();
                        let _ = handle.link().set(msg).execute().await;
                    }

                    let msg = if iface.up {
                        rtnetlink::LinkUnspec::new_with_index(index).up().build()
                    } else {
                        rtnetlink::LinkUnspec::new_with_index(index).down().build()
                    };
                    let _ = handle.link().set(msg).execute().await;

                    let current_msgs: Vec<_> = handle
                        .address()
                        .get()
                        .set_link_index_filter(index)
                        .execute()
                        .try_collect()
                        .await
                        .unwrap_or_default();
                    let current: Vec<(String, _)> = current_msgs
                        .into_iter()
                        .filter_map(|m| {
                            m.attributes.iter().find_map(|a| match a {
                                rtnetlink::packet_route::address::AddressAttribute::Address(ip) => {
                                    Some(format!("{ip}/{}", m.header.prefix_len))
                                }
                                _ => None,
                            }).map(|cidr| (cidr, m))
                        })
                        .collect();
                    let current_cidrs: Vec<&String> = current.iter().map(|(cidr, _)| cidr).collect();

                    for (_, msg) in current.iter().filter(|(cidr, _)| !iface.addresses.contains(cidr)) {
                        let _ = handle.address().del(msg.clone()).execute().await;
                    }

                    for wanted in iface.addresses.iter().filter(|a| !current_cidrs.iter().any(|c| *c == *a)) {
                        if let Ok(network) = wanted.parse::<ipnetwork::IpNetwork>() {
                            let _ = handle.address().add(index, network.ip(), network.prefix()).execute().await;
                        }
                    }
                }
            }

            if scopes.contains(&"routes") {
                for route in &snapshot.routes {
                    if route.destination == "default" {
                        continue;
                    }
                    let Ok((dest, prefix)) = super::parse_cidr(&route.destination) else {
                        continue;
                    };
                    let mut req = handle.route().add().v4();
                    if let IpAddr::V4(v4) = dest {
                        req = req.destination_prefix(v4, prefix);
                    }
                    if !route.gateway.is_empty()
                        && let Ok(IpAddr::V4(gw)) = route.gateway.parse::<IpAddr>()
                    {
                        req = req.gateway(gw);
                    }
                    req = req.table_id(if route.table == 0 { 254 } else { route.table });
                    // A route that already exists errors harmlessly; restore
                    // only needs to ensure it's present again.
                    let _ = req.execute().await;
                }
            }

            Ok(())
        }

        async fn list_candidate_links(&self) -> Result<Vec<super::DetectedLink>, NetlinkError> {
            let handle = Self::handle().await?;

            let mut default_route_index = None;
            let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
            while let Some(msg) = routes
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                if msg.header.destination_prefix_length == 0 {
                    default_route_index = msg.attributes.iter().find_map(|a| match a {
                        rtnetlink::packet_route::route::RouteAttribute::Oif(idx) => Some(*idx),
                        _ => None,
                    });
                    break;
                }
            }

            let mut links = handle.link().get().execute();
            let mut detected = Vec::new();
            while let Some(link) = links
                .try_next()
                .await
                .map_err(|e| NetlinkError::Netlink(e.to_string()))?
            {
                let name = link
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        rtnetlink::packet_route::link::LinkAttribute::IfName(n) => Some(n.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                let is_loopback = link
                    .header
                    .flags
                    .contains(rtnetlink::packet_route::link::LinkFlags::Loopback);
                let has_default_route = default_route_index == Some(link.header.index);

                let mut addresses = handle
                    .address()
                    .get()
                    .set_link_index_filter(link.header.index)
                    .execute();
                let mut ipaddr = None;
                let mut netmask = None;
                if let Some(addr_msg) = addresses
                    .try_next()
                    .await
                    .map_err(|e| NetlinkError::Netlink(e.to_string()))?
                {
                    for attr in &addr_msg.attributes {
                        if let rtnetlink::packet_route::address::AddressAttribute::Address(ip) = attr {
                            ipaddr = Some(ip.to_string());
                            netmask = Some(prefix_to_netmask(addr_msg.header.prefix_len));
                            break;
                        }
                    }
                }

                detected.push(super::DetectedLink {
                    name,
                    is_loopback,
                    has_default_route,
                    ipaddr,
                    netmask,
                });
            }

            Ok(detected)
        }
    }

    fn route_matches(
        msg: &rtnetlink::packet_route::route::RouteMessage,
        dest: IpAddr,
        prefix: u8,
        table: u32,
    ) -> bool {
        if msg.header.destination_prefix_length != prefix {
            return false;
        }
        let msg_table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                rtnetlink::packet_route::route::RouteAttribute::Table(t) => Some(*t),
                _ => None,
            })
            .unwrap_or(msg.header.table as u32);
        if msg_table != table {
            return false;
        }
        if prefix == 0 {
            return true;
        }
        msg.attributes.iter().any(|a| match a {
            rtnetlink::packet_route::route::RouteAttribute::Destination(d) => d.to_string() == dest.to_string(),
            _ => false,
        })
    }

    fn prefix_to_netmask(prefix: u8) -> String {
        let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        std::net::Ipv4Addr::from(mask).to_string()
    }

    fn netmask_to_prefix(netmask: &str) -> Option<u8> {
        let addr: std::net::Ipv4Addr = netmask.parse().ok()?;
        Some(u32::from(addr).count_ones() as u8)
    }
}

pub fn parse_cidr(s: &str) -> Result<(std::net::IpAddr, u8), NetlinkError> {
    let network: ipnetwork::IpNetwork = s
        .parse()
        .map_err(|_| NetlinkError::AddrParse(s.to_string()))?;
    Ok((network.ip(), network.prefix()))
}

#[cfg(test)]
pub mod mock {
    //! An in-memory [`Platform`] for pipeline and reconciler unit tests —
    //! records every call instead of touching the kernel.

    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use jack_types::checkpoint::SystemSnapshot;

    use super::*;

    #[derive(Default)]
    pub struct MockPlatform {
        pub existing_links: Mutex<BTreeSet<String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_route: Mutex<bool>,
        pub candidate_links: Mutex<Vec<super::DetectedLink>>,
        /// port name -> bridge name, mirroring what `bridge_members` would
        /// observe in the kernel.
        pub bridge_membership: Mutex<BTreeMap<String, String>>,
    }

    impl MockPlatform {
        pub fn with_links(names: &[&str]) -> Self {
            Self {
                existing_links: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(Vec::new()),
                fail_route: Mutex::new(false),
                candidate_links: Mutex::new(Vec::new()),
                bridge_membership: Mutex::new(BTreeMap::new()),
            }
        }

        pub fn with_candidate_links(links: Vec<super::DetectedLink>) -> Self {
            Self {
                candidate_links: Mutex::new(links),
                ..Default::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl Platform for MockPlatform {
        async fn link_exists(&self, name: &str) -> Result<bool, NetlinkError> {
            Ok(self.existing_links.lock().unwrap().contains(name))
        }

        async fn ensure_bridge(&self, name: &str) -> Result<(), NetlinkError> {
            self.record(format!("ensure_bridge:{name}"));
            self.existing_links.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        async fn ensure_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> Result<(), NetlinkError> {
            self.record(format!("ensure_vlan:{name}:{parent}:{vlan_id}"));
            self.existing_links.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        async fn set_master(&self, port: &str, bridge: Option<&str>) -> Result<(), NetlinkError> {
            self.record(format!("set_master:{port}:{bridge:?}"));
            let mut membership = self.bridge_membership.lock().unwrap();
            match bridge {
                Some(b) => {
                    membership.insert(port.to_string(), b.to_string());
                }
                None => {
                    membership.remove(port);
                }
            }
            Ok(())
        }

        async fn bridge_members(&self, bridge: &str) -> Result<Vec<String>, NetlinkError> {
            self.record(format!("bridge_members:{bridge}"));
            Ok(self
                .bridge_membership
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, b)| b.as_str() == bridge)
                .map(|(port, _)| port.clone())
                .collect())
        }

        async fn apply_link_attrs(&self, name: &str, _iface: &Interface) -> Result<(), NetlinkError> {
            self.record(format!("apply_link_attrs:{name}"));
            Ok(())
        }

        async fn spawn_dhcp_client(&self, name: &str) -> Result<(), NetlinkError> {
            self.record(format!("dhcp:{name}"));
            Ok(())
        }

        async fn apply_route(&self, route: &Route) -> Result<(), NetlinkError> {
            if *self.fail_route.lock().unwrap() {
                return Err(NetlinkError::Netlink("mock route failure".into()));
            }
            self.record(format!("apply_route:{}", route.destination));
            Ok(())
        }

        async fn delete_route(&self, route: &Route) -> Result<(), NetlinkError> {
            self.record(format!("delete_route:{}", route.destination));
            Ok(())
        }

        async fn enable_ipv4_forwarding(&self) -> Result<(), NetlinkError> {
            self.record("enable_ipv4_forwarding");
            Ok(())
        }

        async fn capture_snapshot(&self) -> Result<SystemSnapshot, NetlinkError> {
            self.record("capture_snapshot");
            Ok(SystemSnapshot::default())
        }

        async fn restore_snapshot(
            &self,
            _snapshot: &SystemSnapshot,
            _scopes: &[&str],
        ) -> Result<(), NetlinkError> {
            self.record("restore_snapshot");
            Ok(())
        }

        async fn list_candidate_links(&self) -> Result<Vec<super::DetectedLink>, NetlinkError> {
            self.record("list_candidate_links");
            Ok(self.candidate_links.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPlatform;
    use super::*;
    use jack_types::Protocol;

    fn physical(device: &str, enabled: bool) -> Interface {
        Interface {
            kind: InterfaceType::Physical,
            device: device.to_string(),
            device_name: None,
            protocol: Protocol::Static,
            enabled,
            ipaddr: "10.0.0.1".into(),
            netmask: "255.255.255.0".into(),
            gateway: String::new(),
            mtu: Some(1500),
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

    #[tokio::test]
    async fn missing_physical_link_fails_apply() {
        let platform = MockPlatform::default();
        let mut interfaces = BTreeMap::new();
        interfaces.insert("eth0".to_string(), physical("eth0", true));

        let result = apply_interfaces(&platform, &interfaces).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bridge_with_missing_port_fails_before_mutating() {
        let platform = MockPlatform::with_links(&["br0"]);
        let mut bridge = physical("br0", true);
        bridge.kind = InterfaceType::Bridge;
        bridge.bridge_ports = vec!["ghost0".to_string()];

        let mut interfaces = BTreeMap::new();
        interfaces.insert("br0".to_string(), bridge);

        let result = apply_interfaces(&platform, &interfaces).await;
        assert!(result.is_err());
        assert!(platform.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_bridge_ports_is_valid() {
        let platform = MockPlatform::default();
        let mut bridge = physical("br0", true);
        bridge.kind = InterfaceType::Bridge;
        bridge.bridge_ports = vec![];

        let mut interfaces = BTreeMap::new();
        interfaces.insert("br0".to_string(), bridge);

        let result = apply_interfaces(&platform, &interfaces).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wireguard_interfaces_are_excluded_from_core_apply() {
        let platform = MockPlatform::default();
        let mut wg = physical("wg0", true);
        wg.kind = InterfaceType::Wireguard;
        wg.device = "wg0".to_string();

        let mut interfaces = BTreeMap::new();
        interfaces.insert("wg0".to_string(), wg);

        let owned = apply_interfaces(&platform, &interfaces).await.unwrap();
        assert_eq!(owned, vec!["wg0".to_string()]);
        assert!(platform.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_bridge_releases_stale_ports_not_listed() {
        let platform = MockPlatform::with_links(&["br0", "eth1", "eth2"]);
        platform
            .bridge_membership
            .lock()
            .unwrap()
            .insert("eth1".to_string(), "br0".to_string());

        let mut bridge = physical("br0", true);
        bridge.kind = InterfaceType::Bridge;
        bridge.bridge_ports = vec!["eth2".to_string()];

        let mut interfaces = BTreeMap::new();
        interfaces.insert("br0".to_string(), bridge);

        apply_interfaces(&platform, &interfaces).await.unwrap();

        let calls = platform.calls.lock().unwrap();
        assert!(calls.contains(&"set_master:eth1:None".to_string()));
        assert!(calls.contains(&"set_master:eth2:Some(\"br0\")".to_string()));
        let membership = platform.bridge_membership.lock().unwrap();
        assert_eq!(membership.get("eth1"), None);
        assert_eq!(membership.get("eth2").map(String::as_str), Some("br0"));
    }

    #[tokio::test]
    async fn apply_bridge_leaves_listed_ports_untouched_when_already_stable() {
        let platform = MockPlatform::with_links(&["br0", "eth1"]);
        platform
            .bridge_membership
            .lock()
            .unwrap()
            .insert("eth1".to_string(), "br0".to_string());

        let mut bridge = physical("br0", true);
        bridge.kind = InterfaceType::Bridge;
        bridge.bridge_ports = vec!["eth1".to_string()];

        let mut interfaces = BTreeMap::new();
        interfaces.insert("br0".to_string(), bridge);

        apply_interfaces(&platform, &interfaces).await.unwrap();

        let calls = platform.calls.lock().unwrap();
        assert!(!calls.contains(&"set_master:eth1:None".to_string()));
    }

    #[tokio::test]
    async fn order_is_physical_then_vlan_then_bridge() {
        let platform = MockPlatform::with_links(&["eth0"]);
        let mut interfaces = BTreeMap::new();
        interfaces.insert("eth0".to_string(), physical("eth0", true));

        let mut vlan = physical("eth0", true);
        vlan.kind = InterfaceType::Vlan;
        vlan.vlan_id = Some(10);
        interfaces.insert("vlan10".to_string(), vlan);

        let mut bridge = physical("br0", true);
        bridge.kind = InterfaceType::Bridge;
        interfaces.insert("br0".to_string(), bridge);

        apply_interfaces(&platform, &interfaces).await.unwrap();

        let calls = platform.calls.lock().unwrap();
        let vlan_pos = calls.iter().position(|c| c.starts_with("ensure_vlan")).unwrap();
        let bridge_pos = calls.iter().position(|c| c.starts_with("ensure_bridge")).unwrap();
        assert!(vlan_pos < bridge_pos);
    }
}
