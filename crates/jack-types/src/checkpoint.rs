//! Checkpoints: captured kernel state that can be restored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// RFC3339 UTC.
    pub timestamp: String,
    pub reason: String,
    pub snapshot: SystemSnapshot,
}

/// A readable record of kernel link and route state, distinct from a
/// configuration snapshot in the state store (see GLOSSARY).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub interfaces: Vec<InterfaceSnapshot>,
    pub routes: Vec<RouteSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    pub up: bool,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub metric: u32,
    pub table: u32,
}

impl Checkpoint {
    pub fn manual_id(timestamp: &str) -> String {
        format!("manual-{timestamp}")
    }

    pub fn auto_id(timestamp: &str) -> String {
        format!("auto-{timestamp}")
    }

    pub fn is_auto(&self) -> bool {
        self.id.starts_with("auto-")
    }
}
