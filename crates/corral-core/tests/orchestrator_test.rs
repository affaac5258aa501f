//! End-to-end tests for the orchestrator control loop against scripted
//! `DashboardPort`/`SpawnerPort` fakes — no live dashboard or worker
//! processes involved, matching the spec's single-agent-dispatch and
//! exhausted-retry scenarios.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use corral_db::models::{Claim, ClaimSource, ClaimStatus};

use corral_core::orchestrator::{DashboardPort, Orchestrator, OrchestratorConfig, SpawnerPort};
use corral_core::router::TaskRouter;
use corral_core::spawner::{AgentEvent, SpawnOptions, SpawnResult};

fn sample_claim(issue_id: &str) -> Claim {
    let now = chrono::Utc::now();
    Claim {
        id: Uuid::new_v4(),
        issue_id: issue_id.to_string(),
        source: ClaimSource::Github,
        source_ref: None,
        title: "Fix the parser".to_string(),
        description: Some("narrow bug fix".to_string()),
        status: ClaimStatus::Backlog,
        claimant: None,
        progress: 0,
        context: None,
        metadata: None,
        created_at: now,
        updated_at: now,
    }
}

fn base_config() -> OrchestratorConfig {
    OrchestratorConfig {
        dashboard_url: "http://localhost:0".to_string(),
        dashboard_ws_url: "ws://localhost:0/api/ws".to_string(),
        max_agents: 2,
        max_retries: 1,
        base_retry_delay_ms: 10,
        poll_interval_ms: 20,
        graceful_shutdown_ms: 200,
        working_dir: PathBuf::from("/tmp"),
        use_worktrees: false,
        cleanup_worktrees: false,
        worker_command: "true".to_string(),
        worker_args: Vec::new(),
    }
}

/// A `DashboardPort` fake backed by an in-memory claim list, recording
/// every state-changing call it receives.
#[derive(Default)]
struct FakeDashboard {
    claims: Mutex<HashMap<Uuid, Claim>>,
    claimed: Mutex<Vec<Uuid>>,
    review_requested: Mutex<Vec<Uuid>>,
    blocked: Mutex<Vec<Uuid>>,
    released: Mutex<Vec<Uuid>>,
    progress_updates: Mutex<Vec<(Uuid, i32)>>,
}

impl FakeDashboard {
    fn with_claims(claims: Vec<Claim>) -> Self {
        let mut map = HashMap::new();
        for claim in claims {
            map.insert(claim.id, claim);
        }
        Self {
            claims: Mutex::new(map),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DashboardPort for FakeDashboard {
    async fn list_backlog_claims(&self) -> anyhow::Result<Vec<Claim>> {
        Ok(self
            .claims
            .lock()
            .await
            .values()
            .filter(|c| c.status == ClaimStatus::Backlog)
            .cloned()
            .collect())
    }

    async fn get_claim(&self, id: Uuid) -> anyhow::Result<Option<Claim>> {
        Ok(self.claims.lock().await.get(&id).cloned())
    }

    async fn claim_issue(&self, id: Uuid, _agent_id: &str, _agent_type: &str) -> anyhow::Result<()> {
        self.claimed.lock().await.push(id);
        if let Some(claim) = self.claims.lock().await.get_mut(&id) {
            claim.status = ClaimStatus::Active;
        }
        Ok(())
    }

    async fn update_claim_progress(&self, id: Uuid, progress: i32) -> anyhow::Result<()> {
        self.progress_updates.lock().await.push((id, progress));
        Ok(())
    }

    async fn mark_review_requested(&self, id: Uuid) -> anyhow::Result<()> {
        self.review_requested.lock().await.push(id);
        if let Some(claim) = self.claims.lock().await.get_mut(&id) {
            claim.status = ClaimStatus::ReviewRequested;
        }
        Ok(())
    }

    async fn mark_blocked(&self, id: Uuid) -> anyhow::Result<()> {
        self.blocked.lock().await.push(id);
        if let Some(claim) = self.claims.lock().await.get_mut(&id) {
            claim.status = ClaimStatus::Blocked;
        }
        Ok(())
    }

    async fn release_claim(&self, id: Uuid) -> anyhow::Result<()> {
        self.released.lock().await.push(id);
        if let Some(claim) = self.claims.lock().await.get_mut(&id) {
            claim.status = ClaimStatus::Backlog;
            claim.claimant = None;
        }
        Ok(())
    }
}

/// A `SpawnerPort` fake that records every spawn and immediately reports
/// either success or failure over `events_tx`, driven by a per-call script.
struct ScriptedSpawner {
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    outcomes: Mutex<Vec<bool>>,
    spawned: Mutex<Vec<SpawnOptions>>,
}

impl ScriptedSpawner {
    fn new(events_tx: mpsc::UnboundedSender<AgentEvent>, outcomes: Vec<bool>) -> Self {
        Self {
            events_tx,
            outcomes: Mutex::new(outcomes),
            spawned: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SpawnerPort for ScriptedSpawner {
    async fn spawn(&self, options: SpawnOptions) -> SpawnResult {
        self.spawned.lock().await.push(options.clone());
        let succeeds = self.outcomes.lock().await.pop().unwrap_or(true);

        let event = if succeeds {
            AgentEvent::Completed {
                agent_id: options.agent_id.clone(),
                trailing_stdout: "all done".to_string(),
            }
        } else {
            AgentEvent::Failed {
                agent_id: options.agent_id.clone(),
                error: "boom".to_string(),
            }
        };
        let _ = self.events_tx.send(event);

        SpawnResult {
            success: true,
            agent_id: Some(options.agent_id),
            pid: Some(1),
            error: None,
        }
    }

    async fn terminate_all(&self) {}
}

async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_agent_dispatch_marks_review_requested_on_completion() {
    let claim = sample_claim("T-1");
    let claim_id = claim.id;
    let dashboard = Arc::new(FakeDashboard::with_claims(vec![claim]));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let spawner = Arc::new(ScriptedSpawner::new(events_tx, vec![true]));
    let router = Arc::new(TaskRouter::heuristic_only());

    let orchestrator = Arc::new(Orchestrator::new(
        base_config(),
        dashboard.clone() as Arc<dyn DashboardPort>,
        spawner.clone() as Arc<dyn SpawnerPort>,
        router,
        None,
    ));

    orchestrator.start().await.expect("start should succeed");

    let drain_orchestrator = Arc::clone(&orchestrator);
    let drain_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            drain_orchestrator.handle_agent_event(event).await;
        }
    });

    wait_for(
        || {
            dashboard
                .claimed
                .try_lock()
                .map(|v| v.contains(&claim_id))
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;

    wait_for(
        || {
            dashboard
                .review_requested
                .try_lock()
                .map(|v| v.contains(&claim_id))
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;

    assert_eq!(spawner.spawned.lock().await.len(), 1);
    assert_eq!(
        dashboard.claims.lock().await.get(&claim_id).unwrap().status,
        ClaimStatus::ReviewRequested
    );

    orchestrator.stop().await;
    drain_task.abort();
}

#[tokio::test]
async fn exhausted_retries_marks_claim_blocked() {
    let claim = sample_claim("T-2");
    let claim_id = claim.id;
    let dashboard = Arc::new(FakeDashboard::with_claims(vec![claim]));

    // max_retries = 2: the first failure releases the claim back to
    // backlog and schedules a retry (attempts 1 -> 2); the retry ticker
    // re-dispatches it, the second failure pushes attempts to 4, which
    // exceeds max_retries and the claim is blocked after exactly two
    // scripted spawns.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let spawner = Arc::new(ScriptedSpawner::new(events_tx, vec![false, false]));
    let router = Arc::new(TaskRouter::heuristic_only());

    let mut config = base_config();
    config.max_retries = 2;
    config.base_retry_delay_ms = 5;

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        dashboard.clone() as Arc<dyn DashboardPort>,
        spawner.clone() as Arc<dyn SpawnerPort>,
        router,
        None,
    ));

    orchestrator.start().await.expect("start should succeed");

    let drain_orchestrator = Arc::clone(&orchestrator);
    let drain_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            drain_orchestrator.handle_agent_event(event).await;
        }
    });

    wait_for(
        || {
            dashboard
                .blocked
                .try_lock()
                .map(|v| v.contains(&claim_id))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(spawner.spawned.lock().await.len(), 2);
    assert_eq!(
        dashboard.claims.lock().await.get(&claim_id).unwrap().status,
        ClaimStatus::Blocked
    );

    orchestrator.stop().await;
    drain_task.abort();
}

#[tokio::test]
async fn stop_drains_in_flight_agent_before_returning() {
    let claim = sample_claim("T-3");
    let dashboard = Arc::new(FakeDashboard::with_claims(vec![claim]));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let spawner = Arc::new(ScriptedSpawner::new(events_tx, vec![true]));
    let router = Arc::new(TaskRouter::heuristic_only());

    let mut config = base_config();
    config.graceful_shutdown_ms = 2000;

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        dashboard.clone() as Arc<dyn DashboardPort>,
        spawner as Arc<dyn SpawnerPort>,
        router,
        None,
    ));

    orchestrator.start().await.expect("start should succeed");

    let drain_orchestrator = Arc::clone(&orchestrator);
    let drain_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            drain_orchestrator.handle_agent_event(event).await;
        }
    });

    wait_for(
        || {
            dashboard
                .claimed
                .try_lock()
                .map(|v| !v.is_empty())
                .unwrap_or(false)
        },
        Duration::from_secs(2),
    )
    .await;

    let started = tokio::time::Instant::now();
    orchestrator.stop().await;
    // The agent completes almost immediately, so stop() should return
    // well before the 2s graceful-shutdown deadline, not after it.
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "stop() should return once the drained agent's completion is observed, not wait out the deadline"
    );

    drain_task.abort();
}
