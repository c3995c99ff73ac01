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

//! The plugin registry: one [`PluginHandle`] per loaded plugin,
//! indexed both by `namespace` (the primary key used by apply, dependency
//! checks, and service-readiness) and by `plugin_name` (used to look up its
//! `/etc/jack/<plugin-name>.json` config file). Built on `dashmap` since it
//! is touched concurrently from the IPC dispatch task, the apply pipeline,
//! and the observer's auto-reconcile path with no single serializing owner.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use jack_types::{PluginMetadata, RpcRequest};
use tokio::sync::{Mutex, watch};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::error::JackError;
use super::process::{PluginProcess, ProcessError};
use super::rpc::RpcClient;

const FLUSH_DEADLINE: Duration = Duration::from_secs(10);
const WAIT_EXIT_DEADLINE: Duration = Duration::from_secs(5);

/// Single-shot service-readiness latch. Backed by
/// a `watch` channel rather than a plain oneshot so any number of
/// subsequent waiters can observe an already-closed latch — `wait_for`
/// never blocks on a channel that was closed before the waiter arrived.
pub struct ReadyLatch {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ReadyLatch {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Close the latch. Idempotent; only the first call has any effect.
    pub fn close(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until the latch closes or `deadline` elapses, whichever first.
    /// Implemented with a single `watch` wait, never a polling loop.
    /// Returns `Err(())` on timeout.
    pub async fn wait(&self, deadline: Duration) -> Result<(), ()> {
        let mut rx = self.rx.clone();
        let wait = rx.wait_for(|ready| *ready);
        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Ok(()), // sender dropped after closing is still "ready"
            Err(_) => Err(()),
        }
    }
}

pub struct PluginHandle {
    pub namespace: String,
    pub plugin_name: String,
    pub metadata: PluginMetadata,
    pub client: RpcClient,
    pub ready: ReadyLatch,
    process: Mutex<Option<PluginProcess>>,
    log_suppressed: AtomicBool,
    last_applied_bytes: Mutex<Option<Vec<u8>>>,
}

impl PluginHandle {
    pub fn is_log_suppressed(&self) -> bool {
        self.log_suppressed.load(Ordering::Relaxed)
    }

    pub fn suppress_log(&self) {
        self.log_suppressed.store(true, Ordering::Relaxed);
    }

    pub async fn last_applied_bytes(&self) -> Option<Vec<u8>> {
        self.last_applied_bytes.lock().await.clone()
    }

    pub async fn set_last_applied_bytes(&self, bytes: Vec<u8>) {
        *self.last_applied_bytes.lock().await = Some(bytes);
    }
}

#[derive(Default)]
pub struct Registry {
    by_namespace: DashMap<String, Arc<PluginHandle>>,
    by_name: DashMap<String, Arc<PluginHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and register the plugin at `path`.
    pub async fn load(&self, path: &Path) -> Result<Arc<PluginHandle>, ProcessError> {
        let (process, metadata) = PluginProcess::spawn(path).await?;
        let plugin_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.strip_prefix("jack-plugin-"))
            .unwrap_or(&metadata.namespace)
            .to_string();

        let handle = Arc::new(PluginHandle {
            namespace: metadata.namespace.clone(),
            plugin_name: plugin_name.clone(),
            client: process.client.clone(),
            ready: ReadyLatch::new(),
            process: Mutex::new(Some(process)),
            log_suppressed: AtomicBool::new(false),
            last_applied_bytes: Mutex::new(None),
            metadata,
        });

        self.by_namespace.insert(handle.namespace.clone(), handle.clone());
        self.by_name.insert(plugin_name, handle.clone());
        info!(namespace = %handle.namespace, "loaded plugin");
        Ok(handle)
    }

    pub fn by_namespace(&self, namespace: &str) -> Option<Arc<PluginHandle>> {
        self.by_namespace.get(namespace).map(|e| e.clone())
    }

    pub fn by_plugin_name(&self, name: &str) -> Option<Arc<PluginHandle>> {
        self.by_name.get(name).map(|e| e.clone())
    }

    /// Namespaces of every loaded plugin, lexicographically sorted — the
    /// apply pipeline must never iterate `DashMap` directly for an ordered
    /// operation.
    pub fn namespaces_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_namespace.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all_handles(&self) -> Vec<Arc<PluginHandle>> {
        self.by_namespace.iter().map(|e| e.value().clone()).collect()
    }

    /// `(namespace, plugin_name)` for every loaded plugin, used to build a
    /// [`crate::config::PluginNameMap`] for committed-config translation.
    pub fn loaded_plugin_names(&self) -> Vec<(String, String)> {
        self.by_namespace
            .iter()
            .map(|e| (e.key().clone(), e.value().plugin_name.clone()))
            .collect()
    }

    /// A disable of `namespace` fails if any *other* loaded plugin declares
    /// it as a dependency.
    pub fn check_dependencies(&self, namespace: &str) -> Result<(), JackError> {
        for entry in self.by_namespace.iter() {
            if entry.key() == namespace {
                continue;
            }
            if entry.value().metadata.dependencies.iter().any(|d| d == namespace) {
                return Err(JackError::Dependency {
                    namespace: namespace.to_string(),
                    dependent: entry.key().clone(),
                });
            }
        }
        Ok(())
    }

    /// `Flush()` then close the RPC channel. The child is
    /// expected to exit once its stdin is closed; if it doesn't within
    /// [`WAIT_EXIT_DEADLINE`] it is killed.
    pub async fn unload(&self, namespace: &str) -> Result<(), JackError> {
        let Some(handle) = self.by_namespace.get(namespace).map(|e| e.clone()) else {
            return Err(JackError::PluginNotFound(namespace.to_string()));
        };

        if let Err(e) = handle.client.call(RpcRequest::Flush, FLUSH_DEADLINE).await {
            warn!(namespace, error = %e, "flush failed during unload, continuing");
        }

        let mut slot = handle.process.lock().await;
        if let Some(mut process) = slot.take() {
            handle.client.close_write().await;
            match tokio::time::timeout(WAIT_EXIT_DEADLINE, process.wait()).await {
                Ok(Ok(status)) => info!(namespace, ?status, "plugin exited after unload"),
                Ok(Err(e)) => warn!(namespace, error = %e, "error waiting for plugin exit"),
                Err(_) => {
                    warn!(namespace, "plugin did not exit after channel close, killing");
                    process.kill().await;
                }
            }
        }

        self.by_namespace.remove(namespace);
        self.by_name.remove(&handle.plugin_name);
        Ok(())
    }

    /// Flush every loaded plugin in reverse-dependency order, for clean
    /// daemon shutdown. A plugin with no remaining dependents is safe to flush
    /// first, so we repeatedly pick and remove a namespace nothing else
    /// depends on.
    pub async fn shutdown_all(&self) {
        let mut remaining: Vec<String> = self.namespaces_sorted();
        while !remaining.is_empty() {
            let leaf = remaining
                .iter()
                .find(|ns| {
                    !remaining
                        .iter()
                        .any(|other| other != *ns && self.depends_on(other, ns))
                })
                .cloned()
                .unwrap_or_else(|| remaining[0].clone());

            if let Err(e) = self.unload(&leaf).await {
                warn!(namespace = %leaf, error = %e, "failed to unload plugin during shutdown");
            }
            remaining.retain(|ns| ns != &leaf);
        }
    }

    /// Block until `namespace`'s service-readiness latch closes or
    /// `deadline` elapses.
    pub async fn wait_for_service(&self, namespace: &str, deadline: Duration) -> Result<(), JackError> {
        let handle = self
            .by_namespace(namespace)
            .ok_or_else(|| JackError::PluginNotFound(namespace.to_string()))?;
        handle.ready.wait(deadline).await.map_err(|_| JackError::PluginRpc {
            namespace: namespace.to_string(),
            reason: "wait_for_service deadline exceeded".into(),
        })
    }

    fn depends_on(&self, namespace: &str, dependency: &str) -> bool {
        self.by_namespace
            .get(namespace)
            .map(|h| h.metadata.dependencies.iter().any(|d| d == dependency))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_dependencies_blocks_on_dependent_plugin() {
        let registry = Registry::new();
        // Synthesize registry state without spawning real processes by
        // constructing handles through the same path `load` would use is
        // not possible without a real plugin binary, so this test exercises
        // the dependency-graph logic directly against a hand-built map.
        let dependent = Arc::new(PluginHandle {
            namespace: "firewall".into(),
            plugin_name: "firewall".into(),
            metadata: PluginMetadata {
                namespace: "firewall".into(),
                version: "1".into(),
                description: String::new(),
                config_path: None,
                default_config: None,
                dependencies: vec!["monitoring".into()],
                cli_commands: vec![],
            },
            client: test_client(),
            ready: ReadyLatch::new(),
            process: Mutex::new(None),
            log_suppressed: AtomicBool::new(false),
            last_applied_bytes: Mutex::new(None),
        });
        registry.by_namespace.insert("firewall".into(), dependent);

        assert!(registry.check_dependencies("monitoring").is_err());
        assert!(registry.check_dependencies("firewall").is_ok());
    }

    fn test_client() -> RpcClient {
        let (io, _other) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(io);
        RpcClient::spawn(r, w)
    }

    #[tokio::test]
    async fn ready_latch_closes_exactly_once_and_wakes_waiters() {
        let latch = ReadyLatch::new();
        assert!(!latch.is_closed());
        latch.close();
        latch.close();
        assert!(latch.is_closed());
        latch.wait(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_when_never_closed() {
        let latch = ReadyLatch::new();
        let result = latch.wait(Duration::from_millis(10)).await;
        assert!(result.is_err());
    }
}
