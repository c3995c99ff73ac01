//! jack-types: the canonical data model for the jack configuration daemon.
//!
//! Interface, route, and plugin records, plus JSON (de)serialization helpers
//! shared between the daemon's state store, netlink reconciler, and plugin
//! runtime.

pub mod checkpoint;
pub mod config;
pub mod interface;
pub mod ipc;
pub mod jsonpath;
pub mod log;
pub mod plugin;
pub mod route;
pub mod wireguard;

pub use checkpoint::{Checkpoint, InterfaceSnapshot, RouteSnapshot, SystemSnapshot};
pub use config::{JackConfig, LogFormat, LoggingConfig, ObserverConfig, PluginEntry};
pub use interface::{Interface, InterfaceType, Ipv6Config, Protocol};
pub use ipc::{IpcRequest, IpcResponse};
pub use jsonpath::JsonLocationError;
pub use log::{LogLevel, LogRecord};
pub use plugin::{CliCommandDescriptor, PluginMetadata, RpcEnvelope, RpcReply, RpcRequest};
pub use route::Route;
pub use wireguard::WireguardPeer;
