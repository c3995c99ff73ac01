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

//! Plugin subsystem: discovery, process lifecycle, RPC
//! transport, and the registry that ties them together.

pub mod discovery;
pub mod process;
pub mod registry;
pub mod rpc;

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::error::JackError;
use crate::persist::Paths;
use discovery::PluginCandidate;
use registry::{PluginHandle, Registry};
use std::sync::Arc;

/// Owns the plugin registry and the directory it discovers candidates in.
pub struct PluginRuntime {
    pub registry: Registry,
    plugin_dir: PathBuf,
}

impl PluginRuntime {
    pub fn new(plugin_dir: PathBuf) -> Self {
        Self {
            registry: Registry::new(),
            plugin_dir,
        }
    }

    /// Re-run discovery.
    pub async fn rescan(&self) -> Vec<PluginCandidate> {
        discovery::discover(&self.plugin_dir).await
    }

    /// Load (spawn + handshake + `Metadata()`) the plugin named `name`,
    /// found via a fresh discovery pass.
    pub async fn load_by_name(&self, name: &str) -> Result<Arc<PluginHandle>, JackError> {
        let candidates = self.rescan().await;
        let candidate = candidates
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| JackError::PluginNotFound(name.to_string()))?;
        self.load_candidate(&candidate).await
    }

    pub async fn load_candidate(&self, candidate: &PluginCandidate) -> Result<Arc<PluginHandle>, JackError> {
        self.registry.load(&candidate.path).await.map_err(|e| JackError::PluginRpc {
            namespace: candidate.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolve this plugin's config payload: an on-disk file wins, then the
    /// metadata's `default_config`, then `None` (skip during apply, but
    /// keep the plugin loaded for status queries).
    pub async fn resolve_config(&self, handle: &PluginHandle, paths: &Paths) -> Result<Option<Value>, JackError> {
        let path = paths.plugin_config(&handle.plugin_name);
        if let Some(value) = crate::persist::load_json(&path).await? {
            return Ok(Some(value));
        }
        if let Some(default) = &handle.metadata.default_config {
            return Ok(Some(default.clone()));
        }
        info!(namespace = %handle.namespace, "no config file or default_config, skipping during apply");
        Ok(None)
    }

    /// Load every plugin named in `enabled`, tolerating missing binaries by
    /// logging and continuing — one absent plugin must not prevent the
    /// daemon from starting with the rest.
    pub async fn load_enabled(&self, enabled: &[String]) {
        let candidates = self.rescan().await;
        for name in enabled {
            let Some(candidate) = candidates.iter().find(|c| &c.name == name) else {
                warn!(plugin = %name, "enabled plugin not found during discovery");
                continue;
            };
            if let Err(e) = self.load_candidate(candidate).await {
                warn!(plugin = %name, error = %e, "failed to load enabled plugin at startup");
            }
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rescan_returns_empty_for_missing_directory() {
        let runtime = PluginRuntime::new(PathBuf::from("/nonexistent/jack/plugins"));
        assert!(runtime.rescan().await.is_empty());
    }
}
