//! Log record: the unit carried by the emitter bus.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC3339 UTC.
    pub timestamp: String,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}
