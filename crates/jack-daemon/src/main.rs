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

use std::sync::Arc;

use clap::{Parser, Subcommand};
use jack_daemon::emitter::{Emitter, LogSubscriber, PluginSubscriber};
use jack_daemon::ipc::{AppState, Server};
use jack_daemon::netlink::Reconciler;
use jack_daemon::persist::Paths;
use jack_daemon::pipeline::Pipeline;
use jack_daemon::plugin::PluginRuntime;
use jack_daemon::store::StateStore;
use jack_daemon::{boot, config};
use jack_types::{LogLevel, LogRecord};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Transactional network configuration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the configuration daemon (systemd entrypoint).
    Run,

    /// Load and validate the on-disk configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run => run_daemon().await,
        Command::CheckConfig => check_config().await,
    }
}

/// Forwards every emitted log record into `tracing`, so that the in-process
/// bus has at least one always-on subscriber without reaching for
/// the out-of-scope file/journal/SQLite backends.
struct TracingBackend;

impl LogSubscriber for TracingBackend {
    fn deliver(
        &self,
        record: LogRecord,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            match record.level {
                LogLevel::Debug => tracing::debug!(component = %record.component, fields = ?record.fields, "{}", record.message),
                LogLevel::Info => tracing::info!(component = %record.component, fields = ?record.fields, "{}", record.message),
                LogLevel::Warn => tracing::warn!(component = %record.component, fields = ?record.fields, "{}", record.message),
                LogLevel::Error => tracing::error!(component = %record.component, fields = ?record.fields, "{}", record.message),
            }
            Ok(())
        })
    }
}

#[cfg(target_os = "linux")]
async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    use jack_daemon::netlink::linux::LinuxPlatform;
    use jack_daemon::observer::linux::NetlinkEventSource;
    use jack_daemon::observer::Observer;

    let paths = Paths::from_env();
    info!(config_dir = %paths.config_dir.display(), socket = %paths.socket_path.display(), version = env!("GIT_VERSION"), "starting jackd");

    let platform = LinuxPlatform;
    if let Err(e) = boot::first_run(&platform, &paths).await {
        error!(error = %e, "first-run auto-detection failed");
        return Err(Box::new(e));
    }

    let jack_config = config::load_jack_config(&paths).await?;

    // Plugins must be spawned before the committed document is assembled:
    // each plugin's namespace is only known once its `Metadata()` reply has
    // been read, and `load_committed_document` needs that mapping to key
    // committed plugin config by namespace.
    let plugins = PluginRuntime::new(std::path::PathBuf::from(
        std::env::var("JACK_PLUGIN_DIR").unwrap_or_else(|_| jack_daemon::plugin::discovery::DEFAULT_PLUGIN_DIR.to_string()),
    ));
    let enabled: Vec<String> = jack_config
        .plugins
        .iter()
        .filter(|(_, entry)| entry.enabled)
        .map(|(name, _)| name.clone())
        .collect();
    plugins.load_enabled(&enabled).await;

    let plugin_names = config::PluginNameMap::from_pairs(plugins.registry.loaded_plugin_names());
    let committed = config::load_committed_document(&paths, &jack_config, &plugin_names).await?;

    let store = StateStore::new();
    store.load_initial(committed).await;

    let emitter = Arc::new(Emitter::new());
    emitter.subscribe("tracing", Arc::new(TracingBackend));
    for handle in plugins.registry.all_handles() {
        let namespace = handle.namespace.clone();
        emitter.subscribe(namespace, Arc::new(PluginSubscriber { handle }));
    }
    emitter.log(LogLevel::Info, "daemon", "jackd starting up", Default::default());

    let reconciler = Reconciler::new(platform);
    let state = Arc::new(AppState {
        store,
        pipeline: Pipeline::new(),
        plugins,
        reconciler,
        paths,
    });

    let shutdown = CancellationToken::new();
    let server = Server::bind(state.clone()).await?;
    let server_task = tokio::spawn(server.run(shutdown.child_token()));

    let observer_task = match &jack_config.observer {
        Some(cfg) if cfg.enabled => match NetlinkEventSource::new() {
            Ok(source) => {
                let observer = Observer::new(state.clone(), source);
                Some(tokio::spawn(observer.run(shutdown.child_token())))
            }
            Err(e) => {
                warn!(error = %e, "failed to subscribe to kernel events, observer disabled");
                None
            }
        },
        _ => None,
    };

    shutdown_signal().await;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = server_task.await {
        warn!(error = %e, "ipc server task panicked");
    }
    if let Some(task) = observer_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "observer task panicked");
    }

    state.plugins.registry.shutdown_all().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    Err("jackd requires Linux (netlink is not available on this platform)".into())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// `jackd check-config`: load every on-disk document and run the syntactic
/// validators without mutating or persisting anything; a non-zero exit
/// communicates the failure to a caller such as a packaging script.
async fn check_config() -> Result<(), Box<dyn std::error::Error>> {
    let paths = Paths::from_env();
    let jack_config = config::load_jack_config(&paths).await?;
    // check-config never spawns plugins, so every committed plugin field is
    // reported under its name rather than its (unknown) namespace.
    let document = config::load_committed_document(&paths, &jack_config, &config::PluginNameMap::default()).await?;

    if let Some(interfaces) = document.get("interfaces") {
        jack_validate::validate_interfaces(interfaces)?;
    }
    if let Some(routes) = document.get("routes") {
        jack_validate::validate_routes(routes)?;
    }

    info!(config_dir = %paths.config_dir.display(), "configuration is valid");
    Ok(())
}
