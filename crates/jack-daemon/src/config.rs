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

//! Loading `jack.json` into a [`JackConfig`], and the glue between the
//! on-disk, per-file layout and the state store's single committed document.
//! The store itself knows nothing about files; this
//! module is the only place that maps config-type keys to paths.

use std::collections::BTreeMap;

use jack_types::JackConfig;
use serde_json::Value;
use tracing::warn;

use crate::error::JackError;
use crate::persist::{self, Paths};

/// Config types folded into `jack.json` rather than their own file.
const JACK_JSON_KEYS: &[&str] = &["observer", "logging"];

/// Translates between a plugin's *namespace* (the committed document's key
/// for its config, per the state store) and its *plugin name* (the
/// filename-derived key used for `<plugin-name>.json` and `jack.json`'s
/// `plugins` map). Built from the set of currently loaded plugins, since
/// the namespace is only known once a plugin's `Metadata()` reply has been
/// read.
#[derive(Debug, Clone, Default)]
pub struct PluginNameMap {
    name_by_namespace: BTreeMap<String, String>,
    namespace_by_name: BTreeMap<String, String>,
}

impl PluginNameMap {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut name_by_namespace = BTreeMap::new();
        let mut namespace_by_name = BTreeMap::new();
        for (namespace, name) in pairs {
            namespace_by_name.insert(name.clone(), namespace.clone());
            name_by_namespace.insert(namespace, name);
        }
        Self {
            name_by_namespace,
            namespace_by_name,
        }
    }

    fn name_for_namespace(&self, namespace: &str) -> Option<&str> {
        self.name_by_namespace.get(namespace).map(String::as_str)
    }

    fn namespace_for_name(&self, name: &str) -> Option<&str> {
        self.namespace_by_name.get(name).map(String::as_str)
    }
}

pub async fn load_jack_config(paths: &Paths) -> Result<JackConfig, JackError> {
    match persist::load_json(&paths.jack_json()).await? {
        Some(value) => serde_json::from_value(value).map_err(|e| JackError::Persistence {
            path: paths.jack_json().display().to_string(),
            reason: e.to_string(),
        }),
        None => Ok(JackConfig::default()),
    }
}

pub async fn save_jack_config(paths: &Paths, config: &JackConfig) -> Result<(), JackError> {
    let value = serde_json::to_value(config).expect("JackConfig always serializes");
    persist::save_json(&paths.jack_json(), &value).await
}

/// Assemble the single committed document the state store expects at
/// startup: interfaces and routes from their own files, observer and
/// logging from `jack.json`, and one key per enabled plugin *namespace*
/// (translated via `plugin_names`) from its `<plugin-name>.json`. An
/// enabled plugin absent from `plugin_names` (not currently loaded) has no
/// known namespace and is skipped with a warning rather than guessed at.
pub async fn load_committed_document(
    paths: &Paths,
    jack_config: &JackConfig,
    plugin_names: &PluginNameMap,
) -> Result<Value, JackError> {
    let mut document = serde_json::Map::new();

    if let Some(value) = persist::load_json(&paths.interfaces_json()).await? {
        document.insert("interfaces".to_string(), value);
    }
    if let Some(value) = persist::load_json(&paths.routes_json()).await? {
        document.insert("routes".to_string(), value);
    }
    if let Some(observer) = &jack_config.observer {
        document.insert("observer".to_string(), serde_json::to_value(observer).expect("serializes"));
    }
    if let Some(logging) = &jack_config.logging {
        document.insert("logging".to_string(), serde_json::to_value(logging).expect("serializes"));
    }

    for (name, entry) in &jack_config.plugins {
        if !entry.enabled {
            continue;
        }
        let Some(namespace) = plugin_names.namespace_for_name(name) else {
            warn!(plugin = %name, "enabled plugin is not loaded, skipping its committed config");
            continue;
        };
        match persist::load_json(&paths.plugin_config(name)).await? {
            Some(value) => {
                document.insert(namespace.to_string(), value);
            }
            None => warn!(plugin = %name, "enabled plugin has no persisted config file yet"),
        }
    }

    Ok(Value::Object(document))
}

/// The `persist_fn` passed to [`crate::store::StateStore::commit`]: split the
/// newly-committed document back across `interfaces.json`, `routes.json`,
/// `jack.json`, and one `<plugin-name>.json` per plugin namespace field,
/// translating the document's namespace keys back to filenames via
/// `plugin_names`. A namespace with no known plugin name (not currently
/// loaded) falls back to using the namespace itself as the filename.
pub async fn persist_commit(paths: &Paths, document: Value, plugin_names: &PluginNameMap) -> Result<(), JackError> {
    let fields = document.as_object().cloned().unwrap_or_default();

    if let Some(value) = fields.get("interfaces") {
        persist::save_json(&paths.interfaces_json(), value).await?;
    }
    if let Some(value) = fields.get("routes") {
        persist::save_json(&paths.routes_json(), value).await?;
    }

    let mut jack_config = load_jack_config(paths).await?;
    if let Some(value) = fields.get("observer") {
        jack_config.observer = serde_json::from_value(value.clone()).ok();
    }
    if let Some(value) = fields.get("logging") {
        jack_config.logging = serde_json::from_value(value.clone()).ok();
    }
    save_jack_config(paths, &jack_config).await?;

    for (key, value) in &fields {
        if JACK_JSON_KEYS.contains(&key.as_str()) || key == "interfaces" || key == "routes" {
            continue;
        }
        let name = plugin_names.name_for_namespace(key).unwrap_or(key.as_str());
        persist::save_json(&paths.plugin_config(name), value).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(dir: &std::path::Path) -> Paths {
        Paths {
            config_dir: dir.to_path_buf(),
            socket_path: dir.join("jack.sock"),
        }
    }

    #[tokio::test]
    async fn missing_jack_json_yields_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_jack_config(&paths(dir.path())).await.unwrap();
        assert_eq!(config, JackConfig::default());
    }

    #[tokio::test]
    async fn persist_commit_then_load_committed_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let plugin_names = PluginNameMap::default();

        let document = json!({
            "interfaces": {"eth0": {"type": "physical", "device": "eth0"}},
            "routes": {},
            "observer": {"enabled": true, "auto_reconcile": false, "reconcile_interval_ms": 60000},
        });
        persist_commit(&paths, document.clone(), &plugin_names).await.unwrap();

        let jack_config = load_jack_config(&paths).await.unwrap();
        assert!(jack_config.observer.as_ref().unwrap().enabled);

        let reloaded = load_committed_document(&paths, &jack_config, &plugin_names).await.unwrap();
        assert_eq!(reloaded["interfaces"], document["interfaces"]);
        assert_eq!(reloaded["observer"]["enabled"], json!(true));
    }

    #[tokio::test]
    async fn plugin_namespace_fields_land_in_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let plugin_names = PluginNameMap::default();

        let document = json!({"firewall": {"enabled": true}});
        persist_commit(&paths, document, &plugin_names).await.unwrap();

        let loaded = persist::load_json(&paths.plugin_config("firewall")).await.unwrap();
        assert_eq!(loaded, Some(json!({"enabled": true})));
    }

    /// `plugin_namespace_fields_land_in_their_own_file` uses a namespace that
    /// happens to equal its plugin name, which would hide a mixed-up
    /// translation. Here the metadata namespace (`firewall`) and the
    /// filename-derived plugin name (`iptables-firewall`) differ, the way
    /// they would for a plugin binary named `jack-plugin-iptables-firewall`
    /// whose `Metadata()` reply declares `namespace: "firewall"`.
    #[tokio::test]
    async fn persist_commit_translates_namespace_to_plugin_name_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let plugin_names = PluginNameMap::from_pairs([("firewall".to_string(), "iptables-firewall".to_string())]);

        let document = json!({"firewall": {"enabled": true}});
        persist_commit(&paths, document, &plugin_names).await.unwrap();

        let by_name = persist::load_json(&paths.plugin_config("iptables-firewall")).await.unwrap();
        assert_eq!(by_name, Some(json!({"enabled": true})));
        let by_namespace = persist::load_json(&paths.plugin_config("firewall")).await.unwrap();
        assert_eq!(by_namespace, None);
    }

    #[tokio::test]
    async fn load_committed_document_keys_plugin_config_by_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let plugin_names = PluginNameMap::from_pairs([("firewall".to_string(), "iptables-firewall".to_string())]);

        persist::save_json(&paths.plugin_config("iptables-firewall"), &json!({"enabled": true}))
            .await
            .unwrap();

        let mut jack_config = JackConfig::default();
        jack_config.plugins.insert(
            "iptables-firewall".to_string(),
            jack_types::PluginEntry {
                version: "1".to_string(),
                enabled: true,
            },
        );

        let document = load_committed_document(&paths, &jack_config, &plugin_names).await.unwrap();
        assert_eq!(document["firewall"], json!({"enabled": true}));
        assert!(document.get("iptables-firewall").is_none());
    }

    #[tokio::test]
    async fn load_committed_document_skips_enabled_plugin_with_unknown_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        let plugin_names = PluginNameMap::default();

        persist::save_json(&paths.plugin_config("iptables-firewall"), &json!({"enabled": true}))
            .await
            .unwrap();

        let mut jack_config = JackConfig::default();
        jack_config.plugins.insert(
            "iptables-firewall".to_string(),
            jack_types::PluginEntry {
                version: "1".to_string(),
                enabled: true,
            },
        );

        let document = load_committed_document(&paths, &jack_config, &plugin_names).await.unwrap();
        assert!(document.as_object().unwrap().is_empty());
    }
}
