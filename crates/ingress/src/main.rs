//! Fleet Control Plane Server Entry Point
//!
//! ## Startup Flow
//!
//! 1. Parse CLI arguments and initialize tracing
//! 2. Load and validate configuration (TOML + CLI overrides)
//! 3. Construct the store backend (`memory` ships in-tree; external
//!    document-store clients plug in behind the same traits)
//! 4. Build the artifact path: cache, throttle, fetcher, router
//! 5. Start the policies index monitor
//! 6. Start the monitor loop (leader election, per-policy workers)
//! 7. Serve HTTP until ctrl-c
//! 8. Shut down: stop the loop (releases leases), stop the monitor

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use fleet_common::model::ServerIdentity;
use fleet_common::store::{Credentials, DocStore};
use fleet_common::MemStore;
use fleet_coordinator::{
    CoordinatorZero, IndexMonitor, MonitorConfig, MonitorLoop, MonitorLoopConfig,
};
use fleet_ingress::{
    build_router, AllowAll, AppState, ArtifactCache, ArtifactFetcher, CacheConfig, Throttle,
};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .with_target(false)
        .init();

    let cfg = cli.load_config().context("loading configuration")?;
    info!(
        server_id = %cfg.fleet.agent_id,
        version = %cfg.fleet.version,
        backend = %cfg.store.backend,
        "fleet server starting"
    );

    // ── store backend ──────────────────────────────────────────────────
    if cfg.store.backend != "memory" {
        anyhow::bail!(
            "unsupported store backend {:?} (only \"memory\" is built in)",
            cfg.store.backend
        );
    }
    let mem = Arc::new(MemStore::new());
    let store: Arc<dyn DocStore> = mem.clone();
    let credentials: Arc<dyn Credentials> = mem;

    // ── artifact path ──────────────────────────────────────────────────
    let cache = Arc::new(ArtifactCache::new(CacheConfig::from(&cfg.cache)));
    let throttle = Throttle::new(cfg.server.artifact.max_parallel);
    let fetcher = ArtifactFetcher::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        throttle,
        Arc::new(AllowAll),
        cfg.store.artifacts(),
        cfg.server.artifact.throttle_ttl(),
    );
    let app = build_router(Arc::new(AppState {
        fetcher,
        store: Arc::clone(&store),
        credentials: Arc::clone(&credentials),
        agents_index: cfg.store.agents(),
    }));

    // ── coordination plane ─────────────────────────────────────────────
    let monitor = Arc::new(IndexMonitor::new(
        cfg.store.policies(),
        Arc::clone(&store),
        MonitorConfig::from(&cfg.monitor),
    ));
    let identity = ServerIdentity {
        agent_id: cfg.fleet.agent_id.clone(),
        host_id: cfg.fleet.host_id.clone(),
        version: cfg.fleet.version.clone(),
    };
    let monitor_loop = Arc::new(MonitorLoop::new(
        MonitorLoopConfig::from_config(&cfg),
        identity,
        Arc::clone(&store),
        Arc::clone(&credentials),
        Arc::clone(&monitor),
        Arc::new(|| Box::new(CoordinatorZero)),
    ));

    let monitor_shutdown = Arc::new(Notify::new());
    let loop_shutdown = Arc::new(Notify::new());

    let monitor_join = {
        let monitor = Arc::clone(&monitor);
        let shutdown = Arc::clone(&monitor_shutdown);
        tokio::spawn(async move {
            if let Err(err) = monitor.run(shutdown).await {
                error!(error = %err, "index monitor exited with fatal store error");
            }
        })
    };
    let loop_join = {
        let monitor_loop = Arc::clone(&monitor_loop);
        let shutdown = Arc::clone(&loop_shutdown);
        tokio::spawn(async move {
            if let Err(err) = monitor_loop.run(shutdown).await {
                error!(error = %err, "monitor loop exited with fatal store error");
            }
        })
    };

    // ── HTTP ───────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind_addr))?;
    info!(addr = %cfg.server.bind_addr, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // ── shutdown ───────────────────────────────────────────────────────
    info!("shutting down");
    loop_shutdown.notify_one();
    if loop_join.await.is_err() {
        warn!("monitor loop task panicked during shutdown");
    }
    monitor_shutdown.notify_one();
    if monitor_join.await.is_err() {
        warn!("index monitor task panicked during shutdown");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for ctrl-c");
    }
}
