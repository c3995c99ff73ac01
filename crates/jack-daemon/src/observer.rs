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

//! The observer: watches kernel link/address/route events,
//! debounces bursts per interface, and compares the settled state against
//! the applied snapshot, optionally triggering a rate-limited reconcile.
//!
//! Debounce and rate-limiting are both implemented with `tokio::time`
//! deadlines raced inside one `select!`, never a fixed-interval poll.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use jack_types::checkpoint::InterfaceSnapshot;
use jack_types::{Interface, ObserverConfig, Protocol};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::AppState;
use crate::netlink::Platform;

/// Debounce window: how long to wait, after the most recent event for an
/// interface, before re-checking its settled state. Also doubles as the
/// self-suppression window following an `apply` — both concerns are
/// about "was this event caused by our own write", so one constant serves
/// both without drifting apart. 500ms sits comfortably in the tens-to-
/// hundreds-of-milliseconds range kernel netlink bursts settle within.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// A source of "this interface changed" notifications. Abstracted so the
/// debounce/drift/rate-limit logic can be exercised without a kernel.
pub trait EventSource: Send {
    fn next_changed_interface(&mut self) -> impl Future<Output = Option<String>> + Send;
}

pub struct Observer<P: Platform, E: EventSource> {
    state: Arc<AppState<P>>,
    source: E,
    last_reconcile: Option<Instant>,
}

impl<P: Platform, E: EventSource> Observer<P, E> {
    pub fn new(state: Arc<AppState<P>>, source: E) -> Self {
        Self {
            state,
            source,
            last_reconcile: None,
        }
    }

    /// Run until `shutdown` is cancelled or the event source closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut pending: BTreeMap<String, Instant> = BTreeMap::new();

        loop {
            let next_deadline = pending.values().min().copied();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("observer shutting down");
                    break;
                }
                changed = self.source.next_changed_interface() => {
                    match changed {
                        Some(name) => {
                            pending.insert(name, Instant::now() + DEBOUNCE_WINDOW);
                        }
                        None => {
                            warn!("observer event source closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let settled: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in settled {
                        pending.remove(&name);
                        self.process_interface(&name).await;
                    }
                }
            }
        }
    }

    async fn process_interface(&mut self, name: &str) {
        if let Some(last_apply) = self.state.pipeline.last_apply_instant()
            && last_apply.elapsed() < DEBOUNCE_WINDOW
        {
            debug!(interface = name, "event inside self-suppression window, ignoring");
            return;
        }

        let snapshot = match self.state.reconciler.capture_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(interface = name, error = %e, "observer failed to capture kernel snapshot");
                return;
            }
        };
        let observed = snapshot.interfaces.iter().find(|i| i.name == name);

        let applied_value = self.state.store.get_last_applied("interfaces").await;
        let applied: BTreeMap<String, Interface> =
            serde_json::from_value(applied_value).unwrap_or_default();
        let Some(expected) = applied.get(name) else {
            // Not an interface the core apply pipeline owns; ignore.
            return;
        };

        let Some(diagnostic) = detect_drift(expected, observed) else {
            return;
        };
        warn!(interface = name, diagnostic = %diagnostic, "configuration drift detected");

        let observer_config = self.observer_config().await;
        if !observer_config.auto_reconcile {
            return;
        }

        let interval = Duration::from_millis(observer_config.reconcile_interval_ms);
        if let Some(last) = self.last_reconcile
            && last.elapsed() < interval
        {
            info!(interface = name, "reconciliation rate limited");
            return;
        }

        self.last_reconcile = Some(Instant::now());
        match self
            .state
            .pipeline
            .apply(&self.state.store, &self.state.reconciler, &self.state.plugins)
            .await
        {
            Ok(outcome) => info!(message = %outcome.message(), "observer-triggered reconcile completed"),
            Err(e) => warn!(error = %e, "observer-triggered reconcile failed"),
        }
    }

    async fn observer_config(&self) -> ObserverConfig {
        let value = self.state.store.committed_type("observer").await;
        serde_json::from_value(value).unwrap_or_default()
    }
}

/// Compare `expected` (the last-applied core config for this interface)
/// against `observed` (the live kernel snapshot), producing the specific
/// sub-diagnostic describing how they disagree.
fn detect_drift(expected: &Interface, observed: Option<&InterfaceSnapshot>) -> Option<String> {
    let Some(observed) = observed else {
        return Some("deleted externally".to_string());
    };

    if expected.enabled != observed.up {
        return Some(if expected.enabled {
            "is down but should be up".to_string()
        } else {
            "is up but should be down".to_string()
        });
    }

    if let Some(expected_mtu) = expected.mtu
        && let Some(observed_mtu) = observed.mtu
        && observed_mtu != expected_mtu
    {
        return Some(format!("MTU mismatch: expected {expected_mtu}, observed {observed_mtu}"));
    }

    if expected.protocol == Protocol::Static
        && !expected.ipaddr.is_empty()
        && !observed.addresses.iter().any(|a| a.starts_with(&expected.ipaddr))
    {
        return Some(format!("unexpected IP: expected {}", expected.ipaddr));
    }

    None
}

#[cfg(target_os = "linux")]
pub mod linux {
    //! Live event source built on `rtnetlink`'s multicast groups:
    //! `RTMGRP_LINK`, `RTMGRP_IPV4_IFADDR`, `RTMGRP_IPV6_IFADDR`,
    //! `RTMGRP_IPV4_ROUTE`, `RTMGRP_IPV6_ROUTE`.

    use futures::StreamExt;
    use rtnetlink::packet_route::link::LinkAttribute;
    use rtnetlink::packet_route::RouteNetlinkMessage;
    use rtnetlink::sys::{AsyncSocket, SocketAddr};

    use super::EventSource;

    const RTMGRP_LINK: u32 = 1;
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;
    const RTMGRP_IPV6_IFADDR: u32 = 0x100;
    const RTMGRP_IPV4_ROUTE: u32 = 0x40;
    const RTMGRP_IPV6_ROUTE: u32 = 0x400;

    pub struct NetlinkEventSource {
        messages: tokio::sync::mpsc::UnboundedReceiver<(
            rtnetlink::packet_core::NetlinkMessage<RouteNetlinkMessage>,
            SocketAddr,
        )>,
    }

    impl NetlinkEventSource {
        pub fn new() -> std::io::Result<Self> {
            let (mut conn, _handle, messages) =
                rtnetlink::new_connection_with_socket::<rtnetlink::sys::TokioSocket>()?;
            let groups = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR | RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE;
            conn.socket_mut().socket_mut().add_membership(groups)?;
            tokio::spawn(conn);
            Ok(Self { messages })
        }
    }

    impl EventSource for NetlinkEventSource {
        async fn next_changed_interface(&mut self) -> Option<String> {
            loop {
                let (message, _addr) = self.messages.next().await?;
                if let Some(name) = interface_name_of(&message) {
                    return Some(name);
                }
            }
        }
    }

    fn interface_name_of(message: &rtnetlink::packet_core::NetlinkMessage<RouteNetlinkMessage>) -> Option<String> {
        match &message.payload {
            rtnetlink::packet_core::NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(msg))
            | rtnetlink::packet_core::NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(msg)) => msg
                .attributes
                .iter()
                .find_map(|a| match a {
                    LinkAttribute::IfName(name) => Some(name.clone()),
                    _ => None,
                }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mock::MockPlatform;
    use crate::netlink::Reconciler;
    use crate::persist::Paths;
    use crate::pipeline::Pipeline;
    use crate::plugin::PluginRuntime;
    use crate::store::StateStore;
    use jack_types::InterfaceType;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    fn physical(enabled: bool, mtu: Option<u32>) -> Interface {
        Interface {
            kind: InterfaceType::Physical,
            device: "eth0".into(),
            device_name: None,
            protocol: Protocol::Static,
            enabled,
            ipaddr: "10.0.0.1".into(),
            netmask: "255.255.255.0".into(),
            gateway: String::new(),
            mtu,
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

    fn snapshot(up: bool, mtu: Option<u32>, addresses: Vec<&str>) -> InterfaceSnapshot {
        InterfaceSnapshot {
            name: "eth0".into(),
            existed: true,
            kind: None,
            mtu,
            up,
            addresses: addresses.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn matching_state_has_no_drift() {
        let expected = physical(true, Some(1500));
        let observed = snapshot(true, Some(1500), vec!["10.0.0.1"]);
        assert!(detect_drift(&expected, Some(&observed)).is_none());
    }

    #[test]
    fn deleted_interface_is_reported() {
        let expected = physical(true, None);
        assert_eq!(detect_drift(&expected, None), Some("deleted externally".to_string()));
    }

    #[test]
    fn down_when_should_be_up_is_reported() {
        let expected = physical(true, None);
        let observed = snapshot(false, None, vec!["10.0.0.1"]);
        assert_eq!(detect_drift(&expected, Some(&observed)), Some("is down but should be up".to_string()));
    }

    #[test]
    fn mtu_mismatch_is_reported() {
        let expected = physical(true, Some(1500));
        let observed = snapshot(true, Some(9000), vec!["10.0.0.1"]);
        assert!(detect_drift(&expected, Some(&observed)).unwrap().starts_with("MTU mismatch"));
    }

    #[test]
    fn unexpected_ip_is_reported() {
        let expected = physical(true, None);
        let observed = snapshot(true, None, vec!["10.0.0.2"]);
        assert!(detect_drift(&expected, Some(&observed)).unwrap().starts_with("unexpected IP"));
    }

    struct ScriptedSource {
        events: StdMutex<std::collections::VecDeque<Option<String>>>,
    }

    impl EventSource for ScriptedSource {
        async fn next_changed_interface(&mut self) -> Option<String> {
            self.events.lock().unwrap().pop_front().flatten()
        }
    }

    fn test_state() -> Arc<AppState<MockPlatform>> {
        Arc::new(AppState {
            store: StateStore::new(),
            pipeline: Pipeline::new(),
            plugins: PluginRuntime::new(PathBuf::from("/nonexistent")),
            reconciler: Reconciler::new(MockPlatform::with_links(&["eth0"])),
            paths: Paths {
                config_dir: PathBuf::from("/tmp/jack-observer-test"),
                socket_path: PathBuf::from("/tmp/jack-observer-test/jack.sock"),
            },
        })
    }

    #[tokio::test]
    async fn drift_outside_suppression_window_is_logged_without_panicking() {
        let state = test_state();
        state
            .store
            .set_last_applied("interfaces", serde_json::to_value(
                [("eth0".to_string(), physical(true, Some(1500)))].into_iter().collect::<BTreeMap<_, _>>()
            ).unwrap())
            .await;

        let source = ScriptedSource {
            events: StdMutex::new(std::collections::VecDeque::new()),
        };
        let mut observer = Observer::new(state, source);
        observer.process_interface("eth0").await;
    }
}
