// # Corebalancer Agent
//
// Main entry point for the node agent. Loads configuration, opens the
// embedded state store, wires the workload inventory to its source, and
// runs the fast, slow, and persistence loops until a shutdown signal.

use corebalancer::agent::Agent;
use corebalancer::desired::SledDesiredStore;
use corebalancer::inventory::{FileSource, WorkloadInventory, WorkloadSource};
use corebalancer::persistence::LearnerStateStore;
use corebalancer::{AgentConfig, Result, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = match AgentConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };
    if config.node_name.is_empty() {
        config.node_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    }

    info!("Initializing corebalancer agent");
    info!("Version: {}", VERSION);
    info!("Node: {}", config.node_name);
    info!(
        "Capacity: {}m (reserve {}%)",
        config.capacity_millis(),
        config.system_reserve_percent
    );
    info!(
        "Loops: fast {}ms / slow {}ms / persist {}ms",
        config.fast_interval_ms, config.slow_interval_ms, config.persist_interval_ms
    );
    info!("Cgroup root: {}", config.cgroup_root);

    std::fs::create_dir_all(&config.state_path)?;
    let db = sled::open(Path::new(&config.state_path).join("store"))?;
    let store = Arc::new(SledDesiredStore::new(&db)?);
    let learner_store = LearnerStateStore::new(&db)?;

    let inventory = Arc::new(WorkloadInventory::new(&config));

    // Workload source: a node-scoped List/Watch client plugs in here; the
    // standalone binary polls a JSON manifest instead.
    let manifest = std::env::var("COREBALANCER_WORKLOADS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| Path::new(&config.state_path).join("workloads.json"));
    info!("Workload manifest: {}", manifest.display());
    let source = Arc::new(FileSource::new(manifest, Duration::from_secs(3)));
    let events = source.subscribe().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source_task = tokio::spawn(Arc::clone(&source).run(shutdown_rx.clone()));
    let inventory_task = tokio::spawn(Arc::clone(&inventory).run(events, shutdown_rx.clone()));

    let agent = Arc::new(Agent::new(
        config.clone(),
        Arc::clone(&inventory),
        store,
        learner_store,
    ));
    let loop_tasks = agent.spawn_loops(shutdown_rx);

    info!("Agent running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping loops");
    let _ = shutdown_tx.send(true);

    for task in loop_tasks {
        if let Err(e) = task.await {
            warn!("Loop task ended abnormally: {}", e);
        }
    }
    let _ = source_task.await;
    let _ = inventory_task.await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║        Corebalancer - Node CPU Redistribution Agent        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
}
