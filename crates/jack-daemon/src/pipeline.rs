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

//! The apply pipeline: orchestrates the netlink reconciler
//! and the plugin registry against the state store, with change detection,
//! auto-checkpointing, and rollback-on-failure. Also owns checkpoint storage
//! and `rollback`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex as StdMutex;

use jack_types::checkpoint::{Checkpoint, SystemSnapshot};
use jack_types::{Interface, Route, RpcRequest};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::JackError;
use crate::netlink::{NetlinkError, Platform, Reconciler};
use crate::persist::Paths;
use crate::plugin::PluginRuntime;
use crate::store::{StateStore, canonical_bytes, configs_equal};

const AUTO_RING_CAPACITY: usize = 16;
const PLUGIN_APPLY_DEADLINE: Duration = Duration::from_secs(30);
const WIREGUARD_NAMESPACE: &str = "wireguard";

/// Outcome of a successful [`Pipeline::apply`].
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

impl ApplyOutcome {
    pub fn message(&self) -> String {
        if self.applied.is_empty() {
            format!("apply succeeded, nothing changed (skipped: {})", self.skipped.join(", "))
        } else {
            format!(
                "applied: {}; skipped: {}",
                self.applied.join(", "),
                self.skipped.join(", ")
            )
        }
    }
}

/// In-memory ring of auto-checkpoints plus disk-backed manual checkpoints.
/// Manual checkpoints are unbounded and persisted to disk; auto-checkpoints
/// are kept in a bounded ring and may be pruned.
pub struct CheckpointStore {
    auto_ring: StdMutex<VecDeque<Checkpoint>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            auto_ring: StdMutex::new(VecDeque::with_capacity(AUTO_RING_CAPACITY)),
        }
    }

    fn push_auto(&self, checkpoint: Checkpoint) {
        let mut ring = self.auto_ring.lock().unwrap();
        if ring.len() >= AUTO_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(checkpoint);
    }

    fn auto_checkpoints(&self) -> Vec<Checkpoint> {
        self.auto_ring.lock().unwrap().iter().cloned().collect()
    }

    fn find_auto(&self, id: &str) -> Option<Checkpoint> {
        self.auto_ring.lock().unwrap().iter().find(|c| c.id == id).cloned()
    }

    /// List every checkpoint, manual (read from disk) and auto (in-memory),
    /// most recent first.
    pub async fn list(&self, paths: &Paths) -> Vec<Checkpoint> {
        let mut all = self.auto_checkpoints();
        all.extend(read_manual_checkpoints(paths).await);
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all
    }

    pub async fn get(&self, paths: &Paths, id: &str) -> Result<Checkpoint, JackError> {
        if let Some(checkpoint) = self.find_auto(id) {
            return Ok(checkpoint);
        }
        let path = paths.checkpoints_dir().join(format!("{id}.json"));
        let value = crate::persist::load_json(&path).await?.ok_or_else(|| JackError::Persistence {
            path: path.display().to_string(),
            reason: "checkpoint not found".to_string(),
        })?;
        serde_json::from_value(value).map_err(|e| JackError::Persistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// `checkpoint-create`: capture the live system and persist it as
    /// a manual, unbounded checkpoint.
    pub async fn create_manual<P: Platform>(
        &self,
        paths: &Paths,
        reconciler: &Reconciler<P>,
        reason: impl Into<String>,
    ) -> Result<Checkpoint, JackError> {
        let snapshot = reconciler.capture_snapshot().await.map_err(kernel_error("capture_snapshot"))?;
        let timestamp = chrono::Utc::now().to_rfc3339();
        let checkpoint = Checkpoint {
            id: Checkpoint::manual_id(&timestamp),
            timestamp,
            reason: reason.into(),
            snapshot,
        };
        let path = paths.checkpoints_dir().join(format!("{}.json", checkpoint.id));
        let value = serde_json::to_value(&checkpoint).expect("Checkpoint always serializes");
        crate::persist::save_json(&path, &value).await?;
        Ok(checkpoint)
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_manual_checkpoints(paths: &Paths) -> Vec<Checkpoint> {
    let dir = paths.checkpoints_dir();
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match crate::persist::load_json(&path).await {
            Ok(Some(value)) => match serde_json::from_value::<Checkpoint>(value) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %e, "malformed checkpoint file"),
            },
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read checkpoint file"),
        }
    }
    out
}

fn kernel_error(target: &'static str) -> impl FnOnce(NetlinkError) -> JackError {
    move |e| JackError::Kernel {
        target: target.to_string(),
        reason: e.to_string(),
    }
}

/// The apply pipeline itself: a global apply-mutex plus the checkpoint store
/// it populates before every attempt.
pub struct Pipeline {
    apply_lock: Mutex<()>,
    pub checkpoints: CheckpointStore,
    last_apply: StdMutex<Option<Instant>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            apply_lock: Mutex::new(()),
            checkpoints: CheckpointStore::new(),
            last_apply: StdMutex::new(None),
        }
    }

    /// The instant of the last completed apply (successful or rolled back),
    /// used by the observer to suppress self-triggered reconciliation.
    pub fn last_apply_instant(&self) -> Option<Instant> {
        *self.last_apply.lock().unwrap()
    }

    fn record_apply_instant(&self) {
        *self.last_apply.lock().unwrap() = Some(Instant::now());
    }

    /// Run one full apply cycle: enable IPv4 forwarding, checkpoint,
    /// compare committed config against last-applied per type, apply only
    /// what changed in order (interfaces, routes, plugin namespaces
    /// lexicographically), and roll back to the pre-apply checkpoint on any
    /// failure.
    pub async fn apply<P: Platform>(
        &self,
        store: &StateStore,
        reconciler: &Reconciler<P>,
        plugins: &PluginRuntime,
    ) -> Result<ApplyOutcome, JackError> {
        let _guard = self.apply_lock.lock().await;

        reconciler
            .enable_ipv4_forwarding()
            .await
            .map_err(kernel_error("ipv4_forward"))?;

        let snapshot = reconciler.capture_snapshot().await.map_err(kernel_error("capture_snapshot"))?;
        let timestamp = chrono::Utc::now().to_rfc3339();
        let checkpoint = Checkpoint {
            id: Checkpoint::auto_id(&timestamp),
            timestamp,
            reason: "pre-apply".to_string(),
            snapshot,
        };
        self.checkpoints.push_auto(checkpoint.clone());

        match self.run_steps(store, reconciler, plugins).await {
            Ok(outcome) => {
                self.record_apply_instant();
                info!(message = %outcome.message(), "apply succeeded");
                Ok(outcome)
            }
            Err((err, scopes)) => {
                self.record_apply_instant();
                warn!(error = %err, "apply failed, restoring pre-apply checkpoint");
                match reconciler.restore_snapshot(&checkpoint.snapshot, &scopes).await {
                    Ok(()) => Err(err.rolled_back()),
                    Err(restore_err) => Err(err.rollback_failed(restore_err.to_string())),
                }
            }
        }
    }

    /// The body of one apply attempt. Returns the set of scopes touched (for
    /// a failure's rollback) alongside any error.
    async fn run_steps<P: Platform>(
        &self,
        store: &StateStore,
        reconciler: &Reconciler<P>,
        plugins: &PluginRuntime,
    ) -> Result<ApplyOutcome, (JackError, Vec<&'static str>)> {
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        let mut touched: Vec<&'static str> = Vec::new();

        let interfaces_value = store.committed_type("interfaces").await;
        let routes_value = store.committed_type("routes").await;
        let last_interfaces = store.get_last_applied("interfaces").await;
        let last_routes = store.get_last_applied("routes").await;

        let interfaces: BTreeMap<String, Interface> =
            parse_map(&interfaces_value).map_err(|e| (config_error("interfaces", e), touched.clone()))?;
        let routes: BTreeMap<String, Route> =
            parse_map(&routes_value).map_err(|e| (config_error("routes", e), touched.clone()))?;

        let mut wireguard_owned: Vec<String> = Vec::new();

        if configs_equal(&interfaces_value, &last_interfaces) {
            skipped.push("interfaces".to_string());
        } else {
            touched.push("interfaces");
            wireguard_owned = reconciler
                .apply_interfaces(&interfaces)
                .await
                .map_err(|e| (kernel_error("interfaces")(e), touched.clone()))?;
            applied.push("interfaces".to_string());
        }

        if configs_equal(&routes_value, &last_routes) {
            skipped.push("routes".to_string());
        } else {
            touched.push("routes");
            reconciler
                .apply_routes(&routes, &interfaces)
                .await
                .map_err(|e| (kernel_error("routes")(e), touched.clone()))?;
            applied.push("routes".to_string());
        }

        if !wireguard_owned.is_empty() {
            self.apply_wireguard(&interfaces, &wireguard_owned, plugins, &mut applied, &mut skipped)
                .await
                .map_err(|e| (e, touched.clone()))?;
        }

        for namespace in plugins.registry.namespaces_sorted() {
            if namespace == WIREGUARD_NAMESPACE {
                continue; // handled above, alongside its owning interfaces
            }
            let committed = store.committed_type(&namespace).await;
            if committed.is_null() {
                continue;
            }
            let last = store.get_last_applied(&namespace).await;
            if configs_equal(&committed, &last) {
                skipped.push(namespace.clone());
                continue;
            }
            self.apply_plugin(&namespace, committed, plugins)
                .await
                .map_err(|e| (e, touched.clone()))?;
            applied.push(namespace);
        }

        for ty in &applied {
            let value = store.committed_type(ty).await;
            store.set_last_applied(ty, value).await;
        }

        Ok(ApplyOutcome { applied, skipped })
    }

    async fn apply_wireguard(
        &self,
        interfaces: &BTreeMap<String, Interface>,
        owned: &[String],
        plugins: &PluginRuntime,
        applied: &mut Vec<String>,
        skipped: &mut Vec<String>,
    ) -> Result<(), JackError> {
        let Some(handle) = plugins.registry.by_namespace(WIREGUARD_NAMESPACE) else {
            warn!(
                interfaces = ?owned,
                "wireguard interfaces configured but no wireguard provider plugin is loaded"
            );
            skipped.push(WIREGUARD_NAMESPACE.to_string());
            return Ok(());
        };

        let mut config = serde_json::Map::new();
        for name in owned {
            if let Some(iface) = interfaces.get(name) {
                config.insert(name.clone(), serde_json::to_value(iface).expect("Interface always serializes"));
            }
        }
        let config = Value::Object(config);
        let bytes = canonical_bytes(&config);
        if handle.last_applied_bytes().await.as_deref() == Some(bytes.as_slice()) {
            skipped.push(WIREGUARD_NAMESPACE.to_string());
            return Ok(());
        }

        handle
            .client
            .call(RpcRequest::ApplyConfig { config }, PLUGIN_APPLY_DEADLINE)
            .await
            .map_err(|e| JackError::PluginRpc {
                namespace: WIREGUARD_NAMESPACE.to_string(),
                reason: e.to_string(),
            })?;
        handle.ready.close();
        handle.set_last_applied_bytes(bytes).await;
        applied.push(WIREGUARD_NAMESPACE.to_string());
        Ok(())
    }

    async fn apply_plugin(&self, namespace: &str, config: Value, plugins: &PluginRuntime) -> Result<(), JackError> {
        let handle = plugins
            .registry
            .by_namespace(namespace)
            .ok_or_else(|| JackError::PluginNotFound(namespace.to_string()))?;
        let bytes = canonical_bytes(&config);
        handle
            .client
            .call(RpcRequest::ApplyConfig { config }, PLUGIN_APPLY_DEADLINE)
            .await
            .map_err(|e| JackError::PluginRpc {
                namespace: namespace.to_string(),
                reason: e.to_string(),
            })?;
        handle.ready.close();
        handle.set_last_applied_bytes(bytes).await;
        Ok(())
    }

    /// `rollback(id)`: restore a named checkpoint's kernel snapshot in
    /// full (both scopes), without touching the state store's committed
    /// config — the operator is expected to follow with a matching `set` +
    /// `commit` if they want the config to agree with kernel state again.
    pub async fn rollback<P: Platform>(
        &self,
        paths: &Paths,
        reconciler: &Reconciler<P>,
        id: &str,
    ) -> Result<(), JackError> {
        let checkpoint = self.checkpoints.get(paths, id).await?;
        reconciler
            .restore_snapshot(&checkpoint.snapshot, &["interfaces", "routes"])
            .await
            .map_err(kernel_error("restore_snapshot"))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn config_error(config_type: &str, reason: String) -> JackError {
    JackError::InvalidRequest(format!("{config_type} config is malformed: {reason}"))
}

fn parse_map<T: serde::de::DeserializeOwned>(value: &Value) -> Result<BTreeMap<String, T>, String> {
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mock::MockPlatform;
    use crate::plugin::PluginRuntime;
    use serde_json::json;
    use std::path::PathBuf;

    fn reconciler() -> Reconciler<MockPlatform> {
        Reconciler::new(MockPlatform::default())
    }

    #[tokio::test]
    async fn apply_skips_unchanged_types() {
        let store = StateStore::new();
        let pipeline = Pipeline::new();
        let reconciler = reconciler();
        let plugins = PluginRuntime::new(PathBuf::from("/nonexistent"));

        let outcome = pipeline.apply(&store, &reconciler, &plugins).await.unwrap();
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.skipped, vec!["interfaces".to_string(), "routes".to_string()]);
    }

    #[tokio::test]
    async fn apply_applies_changed_interfaces_and_records_last_applied() {
        let store = StateStore::new();
        store
            .set(
                "interfaces",
                json!({
                    "eth0": {
                        "type": "physical",
                        "device": "eth0",
                        "enabled": true,
                        "protocol": "static",
                        "ipaddr": "10.0.0.1",
                        "netmask": "255.255.255.0"
                    }
                }),
            )
            .await
            .unwrap();
        store.commit(|_| async { Ok(()) }).await.unwrap();

        let pipeline = Pipeline::new();
        let reconciler = Reconciler::new(MockPlatform::with_links(&["eth0"]));
        let plugins = PluginRuntime::new(PathBuf::from("/nonexistent"));

        let outcome = pipeline.apply(&store, &reconciler, &plugins).await.unwrap();
        assert_eq!(outcome.applied, vec!["interfaces".to_string()]);

        let second = pipeline.apply(&store, &reconciler, &plugins).await.unwrap();
        assert!(second.applied.is_empty());
        assert!(second.skipped.contains(&"interfaces".to_string()));
    }

    #[tokio::test]
    async fn apply_pushes_an_auto_checkpoint_every_attempt() {
        let store = StateStore::new();
        let pipeline = Pipeline::new();
        let reconciler = reconciler();
        let plugins = PluginRuntime::new(PathBuf::from("/nonexistent"));

        pipeline.apply(&store, &reconciler, &plugins).await.unwrap();
        pipeline.apply(&store, &reconciler, &plugins).await.unwrap();

        assert_eq!(pipeline.checkpoints.auto_checkpoints().len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_create_and_list_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: dir.path().to_path_buf(),
            socket_path: dir.path().join("jack.sock"),
        };
        let pipeline = Pipeline::new();
        let reconciler = reconciler();

        let created = pipeline
            .checkpoints
            .create_manual(&paths, &reconciler, "before maintenance")
            .await
            .unwrap();
        assert!(created.id.starts_with("manual-"));

        let listed = pipeline.checkpoints.list(&paths).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);

        let fetched = pipeline.checkpoints.get(&paths, &created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn rollback_restores_a_known_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: dir.path().to_path_buf(),
            socket_path: dir.path().join("jack.sock"),
        };
        let pipeline = Pipeline::new();
        let reconciler = reconciler();

        let checkpoint = pipeline
            .checkpoints
            .create_manual(&paths, &reconciler, "manual test")
            .await
            .unwrap();

        pipeline.rollback(&paths, &reconciler, &checkpoint.id).await.unwrap();
    }
}
