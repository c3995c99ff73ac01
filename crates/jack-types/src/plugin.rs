//! Wire types exchanged with plugin processes. These are pure data —
//! the live RPC transport and process handle live in `jack-daemon::plugin`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response to the mandatory first `Metadata()` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub namespace: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub cli_commands: Vec<CliCommandDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliCommandDescriptor {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub subcommands: Vec<String>,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// Negotiated once, before `Metadata()`, over the same framed transport.
pub const RPC_PROTOCOL_VERSION: u32 = 1;

/// The seven RPC methods, plus the handshake that precedes them, as
/// a tagged request envelope. Each side owns the schema of its own opaque
/// payload bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    Handshake { protocol_version: u32 },
    Metadata,
    ApplyConfig { config: Value },
    ValidateConfig { config: Value },
    Flush,
    Status,
    #[serde(rename = "ExecuteCLICommand")]
    ExecuteCliCommand { command: String, args: Vec<String> },
    OnLogEvent { event: Value },
}

impl RpcRequest {
    pub fn method_name(&self) -> &'static str {
        match self {
            RpcRequest::Handshake { .. } => "Handshake",
            RpcRequest::Metadata => "Metadata",
            RpcRequest::ApplyConfig { .. } => "ApplyConfig",
            RpcRequest::ValidateConfig { .. } => "ValidateConfig",
            RpcRequest::Flush => "Flush",
            RpcRequest::Status => "Status",
            RpcRequest::ExecuteCliCommand { .. } => "ExecuteCLICommand",
            RpcRequest::OnLogEvent { .. } => "OnLogEvent",
        }
    }
}

/// Envelope carried over the framed transport (daemon -> plugin).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: RpcRequest,
}

/// Envelope carried back (plugin -> daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match (self.result, self.error) {
            (Some(v), _) => Ok(v),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(Value::Null),
        }
    }
}
