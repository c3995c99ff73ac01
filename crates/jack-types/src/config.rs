//! Top-level `jack.json` config: plugin enablement, observer, and logging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::log::LogLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JackConfig {
    pub version: String,

    /// Keyed by plugin name. A `BTreeMap` so iteration during apply is
    /// always lexicographic and reproducible.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer: Option<ObserverConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl Default for JackConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            plugins: BTreeMap::new(),
            observer: None,
            logging: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub version: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub auto_reconcile: bool,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_reconcile_interval_ms() -> u64 {
    60_000
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_reconcile: false,
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    #[serde(default)]
    pub outputs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}
