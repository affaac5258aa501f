//! `corral run`: wires the orchestrator control loop to a live dashboard
//! service and a pool of external worker processes.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use corral_core::dashboard_client::{DashboardClient, DashboardClientConfig};
use corral_core::isolation::WorktreeManager;
use corral_core::orchestrator::{DashboardPort, Orchestrator, SpawnerPort};
use corral_core::router::TaskRouter;
use corral_core::spawner::AgentSpawner;

use crate::config::resolve_orchestrator_config;

pub async fn run(
    dashboard_url_flag: Option<&str>,
    worker_command: String,
    worker_args: Vec<String>,
    dry_run: bool,
) -> Result<()> {
    let config = resolve_orchestrator_config(dashboard_url_flag, worker_command, worker_args)?;

    if dry_run {
        println!("resolved configuration:");
        println!("  dashboard_url = {}", config.dashboard_url);
        println!("  dashboard_ws_url = {}", config.dashboard_ws_url);
        println!("  max_agents = {}", config.max_agents);
        println!("  max_retries = {}", config.max_retries);
        println!("  base_retry_delay_ms = {}", config.base_retry_delay_ms);
        println!("  poll_interval_ms = {}", config.poll_interval_ms);
        println!("  graceful_shutdown_ms = {}", config.graceful_shutdown_ms);
        println!("  working_dir = {}", config.working_dir.display());
        println!("  use_worktrees = {}", config.use_worktrees);
        println!("  cleanup_worktrees = {}", config.cleanup_worktrees);
        println!("  worker_command = {}", config.worker_command);
        return Ok(());
    }

    let dashboard = Arc::new(DashboardClient::new(DashboardClientConfig {
        base_url: config.dashboard_url.clone(),
        ws_url: config.dashboard_ws_url.clone(),
    }));

    let (agent_events_tx, mut agent_events_rx) = mpsc::unbounded_channel();
    let spawner = Arc::new(AgentSpawner::new(agent_events_tx));
    let router = Arc::new(TaskRouter::heuristic_only());

    let worktrees = if config.use_worktrees {
        match WorktreeManager::new(config.working_dir.clone()).await {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn!(error = %err, "worktree isolation unavailable, running workers directly in the working directory");
                None
            }
        }
    } else {
        None
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        dashboard.clone() as Arc<dyn DashboardPort>,
        spawner as Arc<dyn SpawnerPort>,
        router,
        worktrees,
    ));

    orchestrator.start().await?;

    let mut dashboard_frames = dashboard.connect().await?;
    let stream_orchestrator = Arc::clone(&orchestrator);
    let stream_task = tokio::spawn(async move {
        while let Some(frame) = dashboard_frames.recv().await {
            stream_orchestrator.handle_stream_message(frame).await;
        }
    });

    let agent_event_orchestrator = Arc::clone(&orchestrator);
    let agent_event_task = tokio::spawn(async move {
        while let Some(event) = agent_events_rx.recv().await {
            agent_event_orchestrator.handle_agent_event(event).await;
        }
    });

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        // Concurrent SIGINT/SIGTERM deliveries coalesce onto this single
        // Notify, firing the orchestrator's stop exactly once.
        shutdown_signal.notify_one();
    });

    shutdown.notified().await;
    info!("shutdown signal received, stopping orchestrator");
    orchestrator.stop().await;
    dashboard.disconnect();

    stream_task.abort();
    agent_event_task.abort();

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
