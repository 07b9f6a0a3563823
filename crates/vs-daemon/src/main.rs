//! vibe-sync daemon — wires the mapping store, external clients, and the
//! sync engine together, then serves the health/webhook endpoints and the
//! background loops until a signal drains it.
//!
//! Exit codes: 0 normal shutdown, 1 fatal config error, 2 fatal dependency
//! unavailable at startup.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use vs_clients::{AgentsClient, HttpCore, PmClient, TrackerClient};
use vs_core::config::Config;
use vs_runtime::{ActivityRunner, RetryPolicy};
use vs_store::MappingStore;
use vs_sync::{
    AgentProvisioner, DedupCache, FileSyncer, PendingOpRecovery, Reconciler, Scheduler,
    SyncOrchestrator, TriggerHub,
};

mod server;
mod watcher;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_CONFIG: u8 = 1;
const EXIT_DEPENDENCY: u8 = 2;

fn main() -> ExitCode {
    // Config before the runtime: a broken config should not even start one.
    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("vs-daemon: configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    vs_telemetry::logging::init("vs-daemon", &vs_telemetry::logging::LogOptions::from_env());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon startup failed");
            ExitCode::from(EXIT_DEPENDENCY)
        }
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "vibe-sync daemon starting");

    // --- Durable state --------------------------------------------------
    let store = Arc::new(
        MappingStore::open(config.db_path())
            .await
            .with_context(|| format!("cannot open mapping store at {:?}", config.db_path()))?,
    );

    // --- External clients ------------------------------------------------
    let http = HttpCore::new(config.http.clone()).context("cannot build http core")?;
    // The PM gets its own core: same throttle/retry knobs, longer
    // per-request deadline for the bulk endpoints.
    let mut pm_http_config = config.http.clone();
    pm_http_config.request_timeout_ms = config.pm.request_timeout_ms;
    let pm_http = HttpCore::new(pm_http_config).context("cannot build PM http core")?;
    let pm = Arc::new(PmClient::new(pm_http, config.pm.api_url.clone()));
    let tracker = Arc::new(TrackerClient::new(config.tracker.repo_root.clone()));

    // Startup probes: a dead dependency now is exit code 2, not a crash
    // loop later.
    pm.list_projects()
        .await
        .context("PM unreachable at startup")?;
    if let Err(e) = tracker.init().await {
        warn!(error = %e, "tracker init failed; continuing, reads may recover it");
    }

    let agents = match (&config.agents.api_url, &config.agents.token) {
        (Some(url), Some(token)) => Some(Arc::new(AgentsClient::new(
            http.clone(),
            url.clone(),
            token.clone(),
        ))),
        _ => {
            info!("agents platform not configured; agent provisioning disabled");
            None
        }
    };

    // --- Engine ----------------------------------------------------------
    let runner = Arc::new(ActivityRunner::new(
        store.clone(),
        RetryPolicy::new(
            config.http.max_retry_attempts,
            Duration::from_millis(config.http.base_backoff_ms),
        ),
    ));
    let dedup = Arc::new(DedupCache::new(store.clone(), config.dedupe_ttl()));
    let provisioner = agents
        .clone()
        .map(|client| Arc::new(AgentProvisioner::new(client, store.clone())));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        store.clone(),
        pm.clone(),
        tracker.clone(),
        provisioner,
        runner.clone(),
        dedup,
        config.clone(),
    ));

    // --- Crash recovery before anything else runs -------------------------
    let recovery = PendingOpRecovery::new(store.clone(), tracker.clone());
    match recovery.run().await {
        Ok(report) if report.examined > 0 => {
            info!(linked = report.linked, abandoned = report.abandoned, "startup recovery done");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup recovery failed; sync will reconverge"),
    }

    // --- Background loops --------------------------------------------------
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let hub = TriggerHub::new(orchestrator.clone());

    let scheduler = Scheduler::new(hub.clone(), store.clone(), config.sync.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let file_syncer = Arc::new(FileSyncer::new(store.clone(), runner.clone()));
    let watcher_task = tokio::spawn(
        watcher::WatcherLoop::new(store.clone(), file_syncer).run(shutdown_rx.clone()),
    );

    let reconciler_task = tokio::spawn(reconcile_loop(
        Reconciler::new(store.clone(), tracker.clone()),
        config.clone(),
        shutdown_rx.clone(),
    ));

    // --- HTTP surface -----------------------------------------------------
    let host: std::net::IpAddr = config
        .daemon
        .health_host
        .parse()
        .with_context(|| format!("bad health host {}", config.daemon.health_host))?;
    server::validate_bind(&host, config.daemon.api_key.as_deref())
        .map_err(|e| anyhow::anyhow!(e))?;
    let listener =
        tokio::net::TcpListener::bind((host, config.daemon.health_port))
            .await
            .with_context(|| {
                format!("cannot bind {host}:{}", config.daemon.health_port)
            })?;
    let server_task = tokio::spawn(server::serve(
        listener,
        server::ServerState {
            hub: hub.clone(),
            api_key: config.daemon.api_key.clone(),
        },
        shutdown_rx.clone(),
    ));

    info!("daemon running");

    // --- Signals ------------------------------------------------------------
    wait_for_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let drain = async {
        let _ = scheduler_task.await;
        let _ = watcher_task.await;
        let _ = reconciler_task.await;
        let _ = server_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(15), drain).await.is_err() {
        warn!("drain timed out, exiting anyway");
    }

    info!("shutdown complete");
    Ok(())
}

async fn reconcile_loop(
    reconciler: Reconciler,
    config: Arc<Config>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick =
        tokio::time::interval(Duration::from_millis(config.reconcile.interval_ms.max(1_000)));
    // Skip the immediate first tick; reconciliation right at boot races
    // the first sync pass.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match reconciler
                    .run_sweep(config.reconcile.action, config.reconcile.dry_run)
                    .await
                {
                    Ok(report) if report.stale > 0 => {
                        info!(stale = report.stale, marked = report.marked,
                            deleted = report.deleted, "reconciliation found stale references");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reconciliation sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
