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

//! The triple-buffered configuration store.
//!
//! One `RwLock<Snapshots>` guards three JSON documents — staged, committed,
//! applied — each a single object keyed by config type ("interfaces",
//! "routes", "observer", "logging", and one key per plugin namespace).
//! Operations are short; nothing here performs I/O while holding the lock —
//! callers that need to persist do so after reading a cloned value out.

use jack_types::jsonpath::{self, canonical_eq, canonicalize};
use jack_validate::{validate_interfaces, validate_opaque, validate_routes};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::diff::unified_diff;
use crate::error::JackError;

/// Config-type names the store understands without delegating to a plugin.
pub const KNOWN_TYPES: &[&str] = &["interfaces", "routes", "observer", "logging"];

#[derive(Debug, Clone, Default)]
struct Snapshots {
    staged: Value,
    committed: Value,
    applied: Value,
}

impl Snapshots {
    fn new() -> Self {
        Self {
            staged: Value::Object(serde_json::Map::new()),
            committed: Value::Object(serde_json::Map::new()),
            applied: Value::Object(serde_json::Map::new()),
        }
    }
}

pub enum DiffBase {
    /// staged vs committed (default)
    Committed,
    /// committed vs applied
    Applied,
}

pub struct StateStore {
    inner: RwLock<Snapshots>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Snapshots::new()),
        }
    }

    /// Seed committed (and therefore staged) state at startup, before any
    /// client has connected.
    pub async fn load_initial(&self, committed: Value) {
        let mut snap = self.inner.write().await;
        snap.committed = committed.clone();
        snap.staged = committed;
    }

    pub async fn get(&self, path: &str) -> Result<Value, JackError> {
        let snap = self.inner.read().await;
        resolve(&snap.staged, path)
    }

    pub async fn show(&self, path: &str) -> Result<Value, JackError> {
        let snap = self.inner.read().await;
        resolve(&snap.committed, path)
    }

    pub async fn set(&self, path: &str, value: Value) -> Result<(), JackError> {
        if path.is_empty() {
            return Err(JackError::InvalidRequest("set requires a non-empty path".into()));
        }
        let mut snap = self.inner.write().await;
        let segments = jsonpath::split_path(path);
        jsonpath::set_path(&mut snap.staged, &segments, value)
            .map_err(JackError::InvalidRequest)?;
        debug!(path, "staged set");
        Ok(())
    }

    /// Validate `value` against `path` without mutating staged state.
    pub fn validate(&self, path: &str, value: &Value) -> Result<(), JackError> {
        let top = jsonpath::split_path(path).first().copied().unwrap_or("");
        match top {
            "interfaces" => validate_interfaces(value)?,
            "routes" => validate_routes(value)?,
            "observer" | "logging" => validate_opaque(value)?,
            _ => validate_opaque(value)?,
        }
        Ok(())
    }

    /// Promote staged to committed and persist via `persist_fn`. On
    /// persistence failure staged/committed are left untouched.
    pub async fn commit<F, Fut>(&self, persist_fn: F) -> Result<(), JackError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: std::future::Future<Output = Result<(), JackError>>,
    {
        let mut snap = self.inner.write().await;

        for ty in toplevel_keys(&snap.staged) {
            if let Some(value) = snap.staged.get(&ty) {
                self.validate(&ty, value)?;
            }
        }

        let candidate = snap.staged.clone();
        persist_fn(candidate.clone()).await?;
        snap.committed = candidate;
        debug!("committed staged configuration");
        Ok(())
    }

    pub async fn revert(&self) {
        let mut snap = self.inner.write().await;
        snap.staged = snap.committed.clone();
        debug!("reverted staged configuration to committed");
    }

    /// Whether staged differs from committed.
    pub async fn has_pending_changes(&self) -> bool {
        let snap = self.inner.read().await;
        !configs_equal(&snap.staged, &snap.committed)
    }

    pub async fn diff(&self, base: DiffBase) -> String {
        let snap = self.inner.read().await;
        let (left, right) = match base {
            DiffBase::Committed => (&snap.staged, &snap.committed),
            DiffBase::Applied => (&snap.committed, &snap.applied),
        };
        let left_text = serde_json::to_string_pretty(left).unwrap_or_default();
        let right_text = serde_json::to_string_pretty(right).unwrap_or_default();
        unified_diff(&right_text, &left_text)
    }

    pub async fn get_last_applied(&self, config_type: &str) -> Value {
        let snap = self.inner.read().await;
        snap.applied
            .get(config_type)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub async fn set_last_applied(&self, config_type: &str, value: Value) {
        let mut snap = self.inner.write().await;
        let map = snap
            .applied
            .as_object_mut()
            .expect("applied snapshot is always an object");
        map.insert(config_type.to_string(), value);
    }

    /// The committed value for `config_type`, used by the apply pipeline's
    /// change-detection pass.
    pub async fn committed_type(&self, config_type: &str) -> Value {
        let snap = self.inner.read().await;
        snap.committed
            .get(config_type)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// All config types currently present in committed state (known types
    /// plus any plugin namespace that has been set).
    pub async fn committed_types(&self) -> Vec<String> {
        let snap = self.inner.read().await;
        let mut types = toplevel_keys(&snap.committed);
        types.sort();
        types
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn configs_equal(a: &Value, b: &Value) -> bool {
    canonical_eq(a, b)
}

pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonicalize(value).into_bytes()
}

fn toplevel_keys(value: &Value) -> Vec<String> {
    value
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn resolve(root: &Value, path: &str) -> Result<Value, JackError> {
    let segments = jsonpath::split_path(path);
    if segments.is_empty() {
        return Ok(root.clone());
    }
    match jsonpath::get_path(root, &segments) {
        Some(v) => Ok(v.clone()),
        None => {
            // An absent value under a *known* top-level type is still a
            // legitimate (empty) read; only a genuinely unrecognized
            // top-level segment combined with a missing value is an error.
            if KNOWN_TYPES.contains(&segments[0]) {
                Ok(Value::Null)
            } else {
                warn!(path, "unknown path");
                Err(JackError::UnknownPath(path.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn iface_doc() -> Value {
        json!({
            "interfaces": {
                "eth0": {
                    "type": "physical",
                    "device": "eth0",
                    "enabled": true,
                    "protocol": "static",
                    "ipaddr": "10.0.0.1",
                    "netmask": "255.255.255.0",
                    "mtu": 1500
                }
            }
        })
    }

    #[tokio::test]
    async fn get_after_commit_matches_show() {
        let store = StateStore::new();
        store.set("interfaces", iface_doc()["interfaces"].clone()).await.unwrap();
        store
            .commit(|_| async { Ok(()) })
            .await
            .unwrap();
        let get = store.get("interfaces").await.unwrap();
        let show = store.show("interfaces").await.unwrap();
        assert_eq!(get, show);
    }

    #[tokio::test]
    async fn revert_discards_staged_edits() {
        let store = StateStore::new();
        store.set("interfaces", iface_doc()["interfaces"].clone()).await.unwrap();
        store.commit(|_| async { Ok(()) }).await.unwrap();

        store
            .set("interfaces.eth0.ipaddr", json!("10.0.0.2"))
            .await
            .unwrap();
        store.revert().await;

        let value = store.get("interfaces.eth0.ipaddr").await.unwrap();
        assert_eq!(value, json!("10.0.0.1"));
    }

    #[tokio::test]
    async fn unknown_top_level_segment_is_plugin_namespace() {
        let store = StateStore::new();
        store.set("firewall.enabled", json!(true)).await.unwrap();
        let value = store.get("firewall.enabled").await.unwrap();
        assert_eq!(value, json!(true));
    }

    #[tokio::test]
    async fn commit_runs_validation_and_rejects_bad_interface() {
        let store = StateStore::new();
        store
            .set(
                "interfaces",
                json!({"eth0": {"type": "ethernet", "device": "eth0"}}),
            )
            .await
            .unwrap();
        let result = store.commit(|_| async { Ok(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn configs_equal_ignores_formatting() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert!(configs_equal(&a, &b));
    }
}
