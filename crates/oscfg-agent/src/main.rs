//! oscfg-agent binary.
//!
//! Startup order matters and mirrors the agent's invariants: the first
//! config snapshot is fetched (blocking, fatal on permanent failure) before
//! logging is initialized from its debug flag, the stale restart marker is
//! cleared, the singleton lock is taken, and only then does the selected
//! mode run. Every exit path drains the deferred-cleanup stack; exit code 1
//! is a startup fatal, exit code 2 is requested-restart (raised inside the
//! service loop's restart watcher).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use oscfg_agent::cleanup::CleanupStack;
use oscfg_agent::executor::TaskExecutor;
use oscfg_agent::metrics::{self, AgentMetrics, DEFAULT_PROFILE_PORT};
use oscfg_agent::rpc::client::AgentClient;
use oscfg_agent::rpc::http::HttpAgentEndpoint;
use oscfg_agent::rpc::stream::TaskStreamClient;
use oscfg_agent::rpc::{AgentEndpoint, RegisterAgentRequest};
use oscfg_agent::service::{
    self, run_service_loop, NoopPolicyRunner, PolicyRunner, ServiceContext,
};
use oscfg_core::config::{ConfigWatcher, HttpMetadataClient, DEFAULT_METADATA_URL};
use oscfg_core::exec::{CommandRunner, SystemRunner};
use oscfg_core::inventory::{InventoryProvider, SystemInventory};
use oscfg_core::keyring::HttpKeyFetcher;
use oscfg_core::lock::{default_lock_path, SingletonLock};
use oscfg_core::packages::{manager_for, PackageFamily};
use oscfg_core::reconcile::{HostCapabilities, HostPaths, Reconciler};
use oscfg_core::tasker::Tasker;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// REST frontend of the agent-endpoint service.
const DEFAULT_ENDPOINT_URL: &str = "https://osconfig.googleapis.com/v1agentendpoint";

/// Task types announced at registration.
const SUPPORTED_TASK_TYPES: &[&str] = &[
    "apply_policies",
    "patch_run",
    "report_inventory",
    "exec_step",
];

#[derive(Parser, Debug)]
#[command(name = "oscfg-agent", version, about = "OS configuration host agent")]
struct Args {
    /// Run mode: empty/run/noservice, inventory/osinventory,
    /// gp/policies/guestpolicies/ospackage, w/waitfortasknotification/ospatch,
    /// wuaupdates <arg>.
    #[arg(value_name = "MODE")]
    mode: Option<String>,

    /// Extra argument for modes that take one.
    #[arg(value_name = "ARG")]
    mode_arg: Option<String>,

    /// Serve profiling and metrics at 127.0.0.1:6060.
    #[arg(long)]
    profile: bool,

    /// Log level when the config snapshot does not force debug.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Instance metadata base URL.
    #[arg(long, default_value = DEFAULT_METADATA_URL)]
    metadata_url: String,

    /// Agent-endpoint service base URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT_URL)]
    endpoint_url: String,

    /// Singleton lock file path.
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Restart marker path.
    #[arg(long)]
    restart_marker: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // wuaupdates runs before any agent plumbing: it is a helper invocation,
    // not an agent start.
    if args.mode.as_deref() == Some("wuaupdates") {
        if let Err(e) = wua_updates(args.mode_arg.as_deref()) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    let cleanups = Arc::new(CleanupStack::new());
    let code = run(args, &cleanups).await;
    cleanups.run();
    std::process::exit(code);
}

/// On Windows builds this emits WUA update data as JSON on stdout; this
/// build links no WUA binding, so the mode exists for interface parity only.
fn wua_updates(_query: Option<&str>) -> Result<()> {
    anyhow::bail!("wuaupdates is not supported on this platform");
}

async fn run(args: Args, cleanups: &Arc<CleanupStack>) -> i32 {
    // First config snapshot, before logging: the snapshot carries the
    // debug flag the subscriber is built from.
    let metadata_client = match HttpMetadataClient::new(&args.metadata_url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error building metadata client: {e}");
            return 1;
        }
    };
    let (watcher, settings_rx) = match ConfigWatcher::start(metadata_client).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("error reading metadata, agent cannot start: {e}");
            return 1;
        }
    };
    let snapshot = settings_rx.borrow().clone();

    let reload_handle = match init_logging(&args, &snapshot) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("error initializing logging: {e}");
            return 1;
        }
    };

    info!(version = AGENT_VERSION, "OSConfig agent starting");

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    // Config watcher keeps the snapshot fresh; a sibling task follows the
    // debug flag so log verbosity changes without a restart.
    tokio::spawn(watcher.run(cancel.child_token()));
    spawn_log_level_updater(settings_rx.clone(), args.log_level.clone(), reload_handle);

    // Clear a stale restart marker from a previous run.
    let restart_marker = args
        .restart_marker
        .clone()
        .unwrap_or_else(service::default_restart_marker);
    if let Some(parent) = restart_marker.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::remove_file(&restart_marker) {
        Ok(()) => info!("removed stale restart marker"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(error = %e, "could not remove restart marker"),
    }

    // One agent per host.
    let lock_path = args.lock_file.clone().unwrap_or_else(default_lock_path);
    let mut lock = match SingletonLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "agent cannot start");
            return 1;
        }
    };
    cleanups.push("release singleton lock", move || lock.release());
    cleanups.push("shutdown notice", || {
        info!(version = AGENT_VERSION, "OSConfig agent shutting down");
    });

    let metrics = match AgentMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!(error = %e, "metrics setup failed");
            return 1;
        }
    };
    if args.profile {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROFILE_PORT));
        let serve_metrics = Arc::clone(&metrics);
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(serve_metrics, addr, serve_cancel).await {
                error!(error = %e, "debug listener failed");
            }
        });
    }

    let ctx = match build_context(&args, settings_rx, cleanups, &metrics, &cancel) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "agent setup failed");
            return 1;
        }
    };

    info!(version = AGENT_VERSION, "OSConfig agent started");

    match args.mode.as_deref() {
        None | Some("" | "run" | "noservice") => {
            run_service_loop(ctx, cancel.clone()).await;
        }
        Some("inventory" | "osinventory") => {
            let executor = ctx.executor.clone();
            if let Err(e) = ctx.tasker.enqueue("Report OSInventory", move |_c| async move {
                executor.report_inventory().await;
            }) {
                error!(error = %e, "could not enqueue inventory report");
            }
            ctx.tasker.close().await;
        }
        Some("gp" | "policies" | "guestpolicies" | "ospackage") => {
            ctx.policy_runner.run(&cancel).await;
            ctx.tasker.close().await;
        }
        Some("w" | "waitfortasknotification" | "ospatch") => {
            if ctx
                .client
                .register_agent(&cancel, &ctx.register_request)
                .await
                .is_ok()
            {
                ctx.stream_client.run(cancel.child_token()).await;
            }
            ctx.tasker.close().await;
        }
        Some(unknown) => {
            error!(mode = unknown, "unknown mode");
            return 1;
        }
    }

    0
}

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn init_logging(args: &Args, snapshot: &oscfg_core::config::AgentSettings) -> Result<ReloadHandle> {
    let level = if snapshot.debug {
        "debug"
    } else {
        &args.log_level
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else if snapshot.disable_local_logging {
        // No local sink; the filter layer still gates any future layers.
        tracing_subscriber::registry().with(filter).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(handle)
}

/// Follow the config debug flag: log verbosity changes without a restart.
fn spawn_log_level_updater(
    mut settings_rx: tokio::sync::watch::Receiver<oscfg_core::config::AgentSettings>,
    base_level: String,
    handle: ReloadHandle,
) {
    tokio::spawn(async move {
        let mut debug_enabled = settings_rx.borrow().debug;
        while settings_rx.changed().await.is_ok() {
            let now_debug = settings_rx.borrow_and_update().debug;
            if now_debug == debug_enabled {
                continue;
            }
            debug_enabled = now_debug;
            let level = if debug_enabled {
                "debug"
            } else {
                base_level.as_str()
            };
            let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
            if handle.reload(filter).is_ok() {
                info!(debug_enabled, "log level updated from config");
            }
        }
    });
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot listen for SIGTERM");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot listen for SIGINT");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("received interrupt");
        }
        cancel.cancel();
    });
}

fn build_context(
    args: &Args,
    settings_rx: tokio::sync::watch::Receiver<oscfg_core::config::AgentSettings>,
    cleanups: &Arc<CleanupStack>,
    metrics: &Arc<AgentMetrics>,
    cancel: &CancellationToken,
) -> Result<ServiceContext> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::default());
    let inventory_provider: Arc<dyn InventoryProvider> =
        Arc::new(SystemInventory::new(AGENT_VERSION));
    let inventory = inventory_provider.inventory();

    let package_manager = match PackageFamily::detect() {
        Some(family) => {
            info!(family = %family, "package manager detected");
            Some(manager_for(family, Arc::clone(&runner)))
        }
        None => {
            info!("no supported package manager on this host");
            None
        }
    };

    let caps = Arc::new(HostCapabilities {
        runner: Arc::clone(&runner),
        package_manager: package_manager.clone(),
        key_fetcher: Arc::new(HttpKeyFetcher::new()),
        inventory: inventory.clone(),
        paths: HostPaths::system(),
    });

    let endpoint: Arc<dyn AgentEndpoint> =
        Arc::new(HttpAgentEndpoint::new(&args.endpoint_url).context("endpoint client")?);
    let client = AgentClient::new(Arc::clone(&endpoint));
    let tasker = Arc::new(Tasker::new(cancel.clone()));
    let executor = TaskExecutor::new(
        Arc::clone(&tasker),
        Arc::new(Reconciler::new(caps)),
        client.clone(),
        inventory_provider,
        package_manager,
        runner,
        Arc::clone(metrics),
    );
    let stream_client = Arc::new(TaskStreamClient::new(
        endpoint,
        executor.clone(),
        Arc::clone(metrics),
    ));

    let snapshot = settings_rx.borrow().clone();
    let register_request = RegisterAgentRequest {
        instance_id: snapshot.instance_id.clone(),
        instance_name: snapshot.instance_name.clone(),
        agent_version: AGENT_VERSION.to_string(),
        supported_capabilities: SUPPORTED_TASK_TYPES
            .iter()
            .map(ToString::to_string)
            .collect(),
        os_short_name: inventory.short_name,
        os_version: inventory.version,
    };

    let policy_runner: Arc<dyn PolicyRunner> = Arc::new(NoopPolicyRunner);

    Ok(ServiceContext {
        settings: settings_rx,
        client,
        executor,
        stream_client,
        tasker,
        policy_runner,
        register_request,
        restart_marker: args
            .restart_marker
            .clone()
            .unwrap_or_else(service::default_restart_marker),
        cleanups: Arc::clone(cleanups),
        metrics: Arc::clone(metrics),
    })
}
