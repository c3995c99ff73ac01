//! Route record.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default)]
    pub metric: u32,

    #[serde(default)]
    pub table: u32,

    #[serde(default)]
    pub enabled: bool,
}

impl Route {
    pub const DEFAULT_DESTINATION: &'static str = "default";

    pub fn is_default(&self) -> bool {
        self.destination == Self::DEFAULT_DESTINATION
    }
}
