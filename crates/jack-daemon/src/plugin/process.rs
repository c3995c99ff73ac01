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

//! Process lifecycle for one plugin: spawn the
//! executable, tie its life to the parent, and negotiate the RPC handshake.

use std::path::Path;
use std::process::Stdio;

use jack_types::{PluginMetadata, RpcRequest, plugin::RPC_PROTOCOL_VERSION};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Duration;
use tracing::{info, warn};

use super::rpc::{RpcClient, RpcError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn plugin: {0}")]
    Spawn(std::io::Error),

    #[error("plugin stdio was not piped")]
    MissingStdio,

    #[error("handshake failed: {0}")]
    Handshake(#[from] RpcError),

    #[error("handshake protocol mismatch: plugin offered {0}")]
    ProtocolMismatch(u32),
}

const METADATA_DEADLINE: Duration = Duration::from_secs(10);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// A spawned plugin child process plus its negotiated RPC client. Dropping
/// this drops the `Child` handle; combined with `kill_on_drop(true)` (and,
/// on Linux, `PR_SET_PDEATHSIG`), the child terminates even if the daemon
/// exits uncleanly.
pub struct PluginProcess {
    pub pid: Option<u32>,
    pub client: RpcClient,
    child: Child,
}

impl PluginProcess {
    /// Spawn `path`, perform the handshake, and issue the mandatory
    /// `Metadata()` call, returning both the process and its metadata.
    pub async fn spawn(path: &Path) -> Result<(Self, PluginMetadata), ProcessError> {
        let mut command = Command::new(path);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        tie_lifetime_to_parent(&mut command);

        let mut child = command.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(ProcessError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingStdio)?;
        let client = RpcClient::spawn(stdout, stdin);

        let mut process = Self { pid, client, child };
        process.handshake().await?;
        let metadata = process.metadata().await?;
        Ok((process, metadata))
    }

    async fn handshake(&mut self) -> Result<(), ProcessError> {
        let result = self
            .client
            .call(
                RpcRequest::Handshake {
                    protocol_version: RPC_PROTOCOL_VERSION,
                },
                HANDSHAKE_DEADLINE,
            )
            .await?;

        let offered = result
            .get("protocol_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if offered != RPC_PROTOCOL_VERSION {
            return Err(ProcessError::ProtocolMismatch(offered));
        }
        Ok(())
    }

    async fn metadata(&self) -> Result<PluginMetadata, ProcessError> {
        let raw = self
            .client
            .call(RpcRequest::Metadata, METADATA_DEADLINE)
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| ProcessError::Handshake(RpcError::Remote(e.to_string())))
    }

    /// Wait for the child to exit, after its RPC channel has been closed by
    /// [`super::registry::Registry::unload`].
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill plugin process");
        }
    }
}

#[cfg(target_os = "linux")]
fn tie_lifetime_to_parent(command: &mut Command) {
    use nix::sys::signal::Signal;

    // SAFETY: `set_pdeathsig` only touches this process's own prctl state
    // between fork and exec; it calls no allocator and is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Some(Signal::SIGTERM))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    info!("registered PR_SET_PDEATHSIG for spawned plugin");
}
