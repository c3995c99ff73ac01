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

//! The IPC server: a Unix-domain stream socket speaking
//! newline-JSON [`IpcRequest`]/[`IpcResponse`] frames, one request per
//! connection, many connections concurrently — the same per-connection task
//! shape as the `alfredjeanlab-oddjobs` listener, adapted to Unix-only and to
//! a strictly request-then-response protocol (no upgraded streams).

use std::sync::Arc;

use jack_types::{IpcRequest, IpcResponse};
use serde_json::{Value, json};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JackError;
use crate::framing::{self, FramingError};
use crate::netlink::{Platform, Reconciler};
use crate::persist::Paths;
use crate::pipeline::Pipeline;
use crate::plugin::PluginRuntime;
use crate::store::{DiffBase, StateStore};
use crate::{config, store};

/// Everything a connection handler needs to dispatch a request. Shared
/// behind an `Arc` since every accepted connection gets its own task.
pub struct AppState<P: Platform> {
    pub store: StateStore,
    pub pipeline: Pipeline,
    pub plugins: PluginRuntime,
    pub reconciler: Reconciler<P>,
    pub paths: Paths,
}

pub struct Server<P: Platform> {
    listener: UnixListener,
    state: Arc<AppState<P>>,
}

impl<P: Platform + Send + Sync + 'static> Server<P> {
    /// Bind the socket at `paths.socket_path`, removing any stale file left
    /// behind by an unclean shutdown, and `chmod` it to 0666.
    pub async fn bind(state: Arc<AppState<P>>) -> Result<Self, JackError> {
        let socket_path = &state.paths.socket_path;
        let _ = tokio::fs::remove_file(socket_path).await;

        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| bind_error(socket_path, e))?;
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| bind_error(socket_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o666);
            tokio::fs::set_permissions(socket_path, perms)
                .await
                .map_err(|e| bind_error(socket_path, e))?;
        }

        info!(path = %socket_path.display(), "ipc server listening");
        Ok(Self { listener, state })
    }

    /// Accept connections until `shutdown` is cancelled, then stop accepting
    /// and let in-flight connections race their own child token to
    /// completion.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("ipc server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let state = self.state.clone();
                            let conn_token = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state, conn_token).await {
                                    debug!(error = %e, "ipc connection ended with an error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "ipc accept error"),
                    }
                }
            }
        }

        let _ = tokio::fs::remove_file(&self.state.paths.socket_path).await;
    }
}

fn bind_error(path: &std::path::Path, e: std::io::Error) -> JackError {
    JackError::Persistence {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

async fn handle_connection<P: Platform + Send + Sync + 'static>(
    stream: UnixStream,
    state: Arc<AppState<P>>,
    cancel: CancellationToken,
) -> Result<(), FramingError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request: IpcRequest = match framing::read_frame(&mut reader).await {
        Ok(request) => request,
        Err(FramingError::Closed) => return Ok(()),
        Err(e) => {
            let response = IpcResponse::err(format!("invalid request: {e}"));
            framing::write_frame(&mut write_half, &response).await?;
            return Ok(());
        }
    };

    let response = tokio::select! {
        response = dispatch(&state, request) => response,
        _ = cancel.cancelled() => IpcResponse::err("daemon shutting down"),
    };

    framing::write_frame(&mut write_half, &response).await
}

/// Route one request to the command it names. `pub`
/// so integration tests can drive the command surface directly, without a
/// socket, the same way `handle_connection` does internally.
pub async fn dispatch<P: Platform>(state: &AppState<P>, req: IpcRequest) -> IpcResponse {
    match req.command.as_str() {
        "status" => IpcResponse::ok("alive"),
        "info" => handle_info(state).await,
        "get" => {
            let path = req.path.as_deref().unwrap_or("");
            match state.store.get(path).await {
                Ok(value) => IpcResponse::data_only(value),
                Err(e) => IpcResponse::err(e.to_string()),
            }
        }
        "show" => {
            let path = req.path.as_deref().unwrap_or("");
            match state.store.show(path).await {
                Ok(value) => IpcResponse::data_only(value),
                Err(e) => IpcResponse::err(e.to_string()),
            }
        }
        "set" => handle_set(state, &req).await,
        "validate" => handle_validate(state, &req).await,
        "commit" => handle_commit(state).await,
        "revert" => {
            state.store.revert().await;
            IpcResponse::ok("staged configuration reverted to committed")
        }
        "diff" => handle_diff(state, &req).await,
        "apply" => handle_apply(state).await,
        "checkpoint-create" => handle_checkpoint_create(state, &req).await,
        "checkpoint-list" => handle_checkpoint_list(state).await,
        "rollback" => handle_rollback(state, &req).await,
        "plugin-rescan" => handle_plugin_rescan(state).await,
        "plugin-enable" => handle_plugin_enable(state, &req).await,
        "plugin-disable" => handle_plugin_disable(state, &req).await,
        "plugin-cli" => handle_plugin_cli(state, &req).await,
        other => IpcResponse::err(format!("unknown command {other:?}")),
    }
}

async fn handle_set<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let Some(path) = req.path.as_deref() else {
        return IpcResponse::err("set requires a path");
    };
    let Some(value) = req.value.clone() else {
        return IpcResponse::err("set requires a value");
    };
    match state.store.set(path, value).await {
        Ok(()) => IpcResponse::ok(format!("staged {path}")),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_validate<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let path = req.path.as_deref().unwrap_or("");
    let Some(value) = req.value.as_ref() else {
        return IpcResponse::err("validate requires a value");
    };
    match state.store.validate(path, value) {
        Ok(()) => IpcResponse::ok("valid"),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_commit<P: Platform>(state: &AppState<P>) -> IpcResponse {
    let paths = state.paths.clone();
    let plugin_names = config::PluginNameMap::from_pairs(state.plugins.registry.loaded_plugin_names());
    let result = state
        .store
        .commit(|document| async move { config::persist_commit(&paths, document, &plugin_names).await })
        .await;
    match result {
        Ok(()) => IpcResponse::ok("committed"),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_diff<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let base = match req.path.as_deref() {
        Some("applied") => DiffBase::Applied,
        _ => DiffBase::Committed,
    };
    let text = state.store.diff(base).await;
    IpcResponse::ok_with_data("diff", json!(text))
}

async fn handle_apply<P: Platform>(state: &AppState<P>) -> IpcResponse {
    match state.pipeline.apply(&state.store, &state.reconciler, &state.plugins).await {
        Ok(outcome) => IpcResponse::ok_with_data(
            outcome.message(),
            json!({"applied": outcome.applied, "skipped": outcome.skipped}),
        ),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_checkpoint_create<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let reason = req
        .value
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or("manual checkpoint")
        .to_string();
    match state
        .pipeline
        .checkpoints
        .create_manual(&state.paths, &state.reconciler, reason)
        .await
    {
        Ok(checkpoint) => IpcResponse::ok_with_data(
            format!("created checkpoint {}", checkpoint.id),
            serde_json::to_value(&checkpoint).expect("Checkpoint always serializes"),
        ),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_checkpoint_list<P: Platform>(state: &AppState<P>) -> IpcResponse {
    let checkpoints = state.pipeline.checkpoints.list(&state.paths).await;
    IpcResponse::data_only(serde_json::to_value(&checkpoints).expect("checkpoints always serialize"))
}

async fn handle_rollback<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let Some(id) = req.checkpoint_id.as_deref() else {
        return IpcResponse::err("rollback requires checkpoint_id");
    };
    match state.pipeline.rollback(&state.paths, &state.reconciler, id).await {
        Ok(()) => IpcResponse::ok(format!("rolled back to {id}")),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

async fn handle_plugin_rescan<P: Platform>(state: &AppState<P>) -> IpcResponse {
    let candidates = state.plugins.rescan().await;
    let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
    IpcResponse::ok_with_data(format!("found {} plugin(s)", names.len()), json!(names))
}

async fn handle_plugin_enable<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let Some(name) = req.plugin.as_deref() else {
        return IpcResponse::err("plugin-enable requires plugin");
    };

    let handle = match state.plugins.load_by_name(name).await {
        Ok(handle) => handle,
        Err(e) => return IpcResponse::err(e.to_string()),
    };

    match state.plugins.resolve_config(&handle, &state.paths).await {
        Ok(Some(config)) => {
            let bytes = store::canonical_bytes(&config);
            if let Err(e) = handle
                .client
                .call(jack_types::RpcRequest::ApplyConfig { config }, std::time::Duration::from_secs(30))
                .await
            {
                return IpcResponse::err(format!("plugin {name} accepted load but rejected config: {e}"));
            }
            handle.ready.close();
            handle.set_last_applied_bytes(bytes).await;
        }
        Ok(None) => debug!(plugin = %name, "loaded without a config, apply will skip it"),
        Err(e) => return IpcResponse::err(e.to_string()),
    }

    if let Err(e) = mark_plugin_enabled(state, name, &handle.metadata.version, true).await {
        return IpcResponse::err(e.to_string());
    }

    IpcResponse::ok(format!("enabled plugin {name}"))
}

async fn handle_plugin_disable<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let Some(name) = req.plugin.as_deref() else {
        return IpcResponse::err("plugin-disable requires plugin");
    };
    let Some(handle) = state.plugins.registry.by_plugin_name(name) else {
        return IpcResponse::err(JackError::PluginNotFound(name.to_string()).to_string());
    };

    if let Err(e) = state.plugins.registry.check_dependencies(&handle.namespace) {
        return IpcResponse::err(e.to_string());
    }
    if let Err(e) = state.plugins.registry.unload(&handle.namespace).await {
        return IpcResponse::err(e.to_string());
    }
    if let Err(e) = mark_plugin_enabled(state, name, &handle.metadata.version, false).await {
        return IpcResponse::err(e.to_string());
    }

    IpcResponse::ok(format!("disabled plugin {name}"))
}

async fn mark_plugin_enabled<P: Platform>(
    state: &AppState<P>,
    name: &str,
    version: &str,
    enabled: bool,
) -> Result<(), JackError> {
    let mut jack_config = config::load_jack_config(&state.paths).await?;
    jack_config
        .plugins
        .entry(name.to_string())
        .and_modify(|e| e.enabled = enabled)
        .or_insert_with(|| jack_types::PluginEntry {
            version: version.to_string(),
            enabled,
        });
    config::save_jack_config(&state.paths, &jack_config).await
}

async fn handle_plugin_cli<P: Platform>(state: &AppState<P>, req: &IpcRequest) -> IpcResponse {
    let Some(name) = req.plugin.as_deref() else {
        return IpcResponse::err("plugin-cli requires plugin");
    };
    let Some(command) = req.cli_command.clone() else {
        return IpcResponse::err("plugin-cli requires cli_command");
    };
    let args = req.cli_args.clone().unwrap_or_default();

    let Some(handle) = state.plugins.registry.by_plugin_name(name) else {
        return IpcResponse::err(JackError::PluginNotFound(name.to_string()).to_string());
    };

    let request = jack_types::RpcRequest::ExecuteCliCommand { command, args };
    match handle.client.call(request, std::time::Duration::from_secs(30)).await {
        Ok(result) => IpcResponse::data_only(result),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

/// `info`: daemon status, kernel interface/route stats, host info,
/// plugin statuses, the staged/committed pending flag, and ip-forwarding
/// state, composed into one response.
async fn handle_info<P: Platform>(state: &AppState<P>) -> IpcResponse {
    let snapshot = match state.reconciler.capture_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return IpcResponse::err(format!("failed to capture kernel snapshot: {e}")),
    };
    let ip_forwarding = match state.reconciler.platform().ipv4_forwarding_enabled().await {
        Ok(v) => v,
        Err(e) => return IpcResponse::err(format!("failed to read ip-forwarding state: {e}")),
    };

    let plugins: Vec<Value> = state
        .plugins
        .registry
        .all_handles()
        .into_iter()
        .map(|h| {
            json!({
                "namespace": h.namespace,
                "plugin_name": h.plugin_name,
                "version": h.metadata.version,
                "ready": h.ready.is_closed(),
            })
        })
        .collect();

    let data = json!({
        "status": "alive",
        "host": host_info(),
        "interfaces": snapshot.interfaces,
        "routes": snapshot.routes,
        "plugins": plugins,
        "pending": state.store.has_pending_changes().await,
        "ip_forwarding": ip_forwarding,
    });
    IpcResponse::data_only(data)
}

#[cfg(target_os = "linux")]
fn host_info() -> Value {
    match nix::sys::utsname::uname() {
        Ok(uts) => json!({
            "hostname": uts.nodename().to_string_lossy(),
            "sysname": uts.sysname().to_string_lossy(),
            "release": uts.release().to_string_lossy(),
            "machine": uts.machine().to_string_lossy(),
        }),
        Err(e) => json!({"error": e.to_string()}),
    }
}

#[cfg(not(target_os = "linux"))]
fn host_info() -> Value {
    json!({"hostname": "unknown"})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mock::MockPlatform;
    use std::path::PathBuf;

    fn state() -> AppState<MockPlatform> {
        AppState {
            store: StateStore::new(),
            pipeline: Pipeline::new(),
            plugins: PluginRuntime::new(PathBuf::from("/nonexistent")),
            reconciler: Reconciler::new(MockPlatform::default()),
            paths: Paths {
                config_dir: PathBuf::from("/tmp/jack-ipc-test"),
                socket_path: PathBuf::from("/tmp/jack-ipc-test/jack.sock"),
            },
        }
    }

    #[tokio::test]
    async fn status_is_always_ok() {
        let state = state();
        let response = dispatch(&state, IpcRequest { command: "status".into(), ..default_req() }).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let state = state();
        let response = dispatch(&state, IpcRequest { command: "bogus".into(), ..default_req() }).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn set_without_path_is_rejected() {
        let state = state();
        let response = dispatch(&state, IpcRequest { command: "set".into(), ..default_req() }).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let state = state();
        let set_req = IpcRequest {
            command: "set".into(),
            path: Some("interfaces".into()),
            value: Some(json!({})),
            ..default_req()
        };
        assert!(dispatch(&state, set_req).await.success);

        let get_req = IpcRequest {
            command: "get".into(),
            path: Some("interfaces".into()),
            ..default_req()
        };
        let response = dispatch(&state, get_req).await;
        assert_eq!(response.data, Some(json!({})));
    }

    #[tokio::test]
    async fn commit_then_info_reports_not_pending() {
        let state = state();
        dispatch(&state, IpcRequest { command: "commit".into(), ..default_req() }).await;
        assert!(!state.store.has_pending_changes().await);
    }

    fn default_req() -> IpcRequest {
        IpcRequest {
            command: String::new(),
            path: None,
            value: None,
            plugin: None,
            cli_command: None,
            cli_args: None,
            checkpoint_id: None,
        }
    }
}
