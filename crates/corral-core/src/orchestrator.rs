//! The control loop: pulls backlog claims, routes and spawns agents,
//! tracks the live-agent table and retry queue, and drains on shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use corral_db::models::{Claim, ClaimFilter, ClaimStatus, Claimant};

use crate::dashboard_client::DashboardClient;
use crate::hub::ServerFrame;
use crate::router::{ModelTier, RoutingContext, TaskRouter};
use crate::spawner::{AgentEvent, AgentSpawner, SpawnError, SpawnOptions, SpawnResult};
use crate::state::{OrchestratorStateMachine, OrchestratorStatus, SpawnedAgentStateMachine, SpawnedAgentStatus};

const RETRY_TICK_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_CAP_MS: u64 = 60_000;
const RETRY_JITTER_FRACTION: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub dashboard_url: String,
    pub dashboard_ws_url: String,
    pub max_agents: usize,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub graceful_shutdown_ms: u64,
    pub working_dir: PathBuf,
    pub use_worktrees: bool,
    pub cleanup_worktrees: bool,
    /// The worker binary to launch per claim; not part of §6.5's
    /// documented env table (the worker is otherwise opaque), so this is
    /// supplied by the CLI layer rather than resolved here.
    pub worker_command: String,
    pub worker_args: Vec<String>,
}

/// Internal lifecycle notifications, distinct from the dashboard-facing
/// `DashboardEvent` stream: these describe the orchestrator's own control
/// flow and are not round-tripped through the hub.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    Started,
    Stopped,
    AgentSpawned { agent_id: String, claim_id: Uuid },
    ClaimAssigned { claim_id: Uuid, agent_id: String },
    PoolCapacityReached,
    AgentFailed { agent_id: String, will_retry: bool },
    AgentCompleted { agent_id: String },
}

#[derive(Debug)]
pub struct SpawnedAgent {
    pub agent_id: String,
    pub agent_type: String,
    pub model_tier: ModelTier,
    pub claim_id: Uuid,
    pub issue_id: String,
    pub status: SpawnedAgentStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Released automatically when this entry is dropped from the live
    /// table, freeing one unit of `maxAgents` capacity.
    permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub claim_id: Uuid,
    pub issue_id: String,
    pub attempts: u32,
    pub next_retry_at: Instant,
    pub last_error: Option<String>,
}

/// The transport the orchestrator drives claims through. A trait so unit
/// tests can stub out the real `DashboardClient` without a live service.
#[async_trait]
pub trait DashboardPort: Send + Sync {
    async fn list_backlog_claims(&self) -> anyhow::Result<Vec<Claim>>;
    async fn get_claim(&self, id: Uuid) -> anyhow::Result<Option<Claim>>;
    async fn claim_issue(&self, id: Uuid, agent_id: &str, agent_type: &str) -> anyhow::Result<()>;
    async fn update_claim_progress(&self, id: Uuid, progress: i32) -> anyhow::Result<()>;
    async fn mark_review_requested(&self, id: Uuid) -> anyhow::Result<()>;
    async fn mark_blocked(&self, id: Uuid) -> anyhow::Result<()>;
    async fn release_claim(&self, id: Uuid) -> anyhow::Result<()>;
}

#[async_trait]
impl DashboardPort for DashboardClient {
    async fn list_backlog_claims(&self) -> anyhow::Result<Vec<Claim>> {
        let filter = ClaimFilter {
            status: vec![ClaimStatus::Backlog],
            ..Default::default()
        };
        Ok(self.list_claims(&filter).await?)
    }

    async fn get_claim(&self, id: Uuid) -> anyhow::Result<Option<Claim>> {
        Ok(DashboardClient::get_claim(self, id).await?)
    }

    async fn claim_issue(&self, id: Uuid, agent_id: &str, _agent_type: &str) -> anyhow::Result<()> {
        self.claim_issue(id, agent_id).await?;
        Ok(())
    }

    async fn update_claim_progress(&self, id: Uuid, progress: i32) -> anyhow::Result<()> {
        let patch = corral_db::models::ClaimPatch {
            progress: Some(progress),
            ..Default::default()
        };
        self.patch_claim(id, &patch).await?;
        Ok(())
    }

    async fn mark_review_requested(&self, id: Uuid) -> anyhow::Result<()> {
        let patch = corral_db::models::ClaimPatch {
            status: Some(ClaimStatus::ReviewRequested),
            progress: Some(100),
            ..Default::default()
        };
        self.patch_claim(id, &patch).await?;
        Ok(())
    }

    async fn mark_blocked(&self, id: Uuid) -> anyhow::Result<()> {
        let patch = corral_db::models::ClaimPatch {
            status: Some(ClaimStatus::Blocked),
            ..Default::default()
        };
        self.patch_claim(id, &patch).await?;
        Ok(())
    }

    async fn release_claim(&self, id: Uuid) -> anyhow::Result<()> {
        self.release_claim(id).await?;
        Ok(())
    }
}

/// The process-spawning surface the orchestrator depends on. A trait so
/// unit tests can exercise retry/capacity logic with a scripted fake
/// rather than real subprocesses.
#[async_trait]
pub trait SpawnerPort: Send + Sync {
    async fn spawn(&self, options: SpawnOptions) -> SpawnResult;
    async fn terminate_all(&self);
}

#[async_trait]
impl SpawnerPort for AgentSpawner {
    async fn spawn(&self, options: SpawnOptions) -> SpawnResult {
        AgentSpawner::spawn(self, options).await
    }

    async fn terminate_all(&self) {
        AgentSpawner::terminate_all(self).await
    }
}

fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exp = base_ms as f64 * 2f64.powi(attempt as i32);
    let capped = exp.min(RETRY_BACKOFF_CAP_MS as f64);
    let jitter = rand::thread_rng().gen_range(0.0..=(capped * RETRY_JITTER_FRACTION));
    (capped + jitter) as u64
}

/// §4.6's `counters (processed/succeeded/failed)`: `processed` counts every
/// dispatch attempt (including retries of the same claim), `succeeded`/
/// `failed` count only terminal outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorCounters {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

struct Inner {
    status: OrchestratorStatus,
    active_agents: HashMap<String, SpawnedAgent>,
    retry_queue: Vec<RetryEntry>,
    processing_claims: std::collections::HashSet<Uuid>,
    counters: OrchestratorCounters,
}

/// Owns the control loop. `dashboard`/`spawner` are trait objects so the
/// same loop logic runs against either the real transport or a test fake.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dashboard: Arc<dyn DashboardPort>,
    spawner: Arc<dyn SpawnerPort>,
    router: Arc<TaskRouter>,
    worktrees: Option<crate::isolation::WorktreeManager>,
    inner: Arc<Mutex<Inner>>,
    capacity: Arc<Semaphore>,
    events_tx: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    shutdown: Arc<Notify>,
    poll_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    retry_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        dashboard: Arc<dyn DashboardPort>,
        spawner: Arc<dyn SpawnerPort>,
        router: Arc<TaskRouter>,
        worktrees: Option<crate::isolation::WorktreeManager>,
    ) -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            capacity: Arc::new(Semaphore::new(config.max_agents)),
            config,
            dashboard,
            spawner,
            router,
            worktrees,
            inner: Arc::new(Mutex::new(Inner {
                status: OrchestratorStatus::Idle,
                active_agents: HashMap::new(),
                retry_queue: Vec::new(),
                processing_claims: std::collections::HashSet::new(),
                counters: OrchestratorCounters::default(),
            })),
            events_tx,
            shutdown: Arc::new(Notify::new()),
            poll_handle: Mutex::new(None),
            retry_handle: Mutex::new(None),
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events_tx.send(event);
    }

    pub async fn status(&self) -> OrchestratorStatus {
        self.inner.lock().await.status
    }

    pub async fn counters(&self) -> OrchestratorCounters {
        self.inner.lock().await.counters
    }

    /// §4.6.2: transition to running, start the poll and retry tickers.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.status = OrchestratorStateMachine::start(inner.status)
            .map_err(|e| anyhow::anyhow!(e))?;
        drop(inner);

        let poll_orch = Arc::clone(self);
        let poll_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(poll_orch.config.poll_interval_ms));
            loop {
                ticker.tick().await;
                poll_orch.poll().await;
            }
        });
        *self.poll_handle.lock().await = Some(poll_handle);

        let retry_orch = Arc::clone(self);
        let retry_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_TICK_INTERVAL);
            loop {
                ticker.tick().await;
                retry_orch.process_retry_queue().await;
            }
        });
        *self.retry_handle.lock().await = Some(retry_handle);

        self.emit(OrchestratorEvent::Started);
        info!("orchestrator started");
        Ok(())
    }

    /// §4.6.3: backlog polling.
    async fn poll(self: &Arc<Self>) {
        if self.status().await != OrchestratorStatus::Running {
            return;
        }
        if self.capacity.available_permits() == 0 {
            return;
        }

        let claims = match self.dashboard.list_backlog_claims().await {
            Ok(claims) => claims,
            Err(err) => {
                warn!(error = %err, "failed to fetch backlog claims");
                return;
            }
        };

        for claim in claims {
            if self.capacity.available_permits() == 0 {
                break;
            }
            {
                let inner = self.inner.lock().await;
                if inner.processing_claims.contains(&claim.id) {
                    continue;
                }
                if inner.retry_queue.iter().any(|r| r.claim_id == claim.id) {
                    continue;
                }
            }
            self.process_claim(claim, 1).await;
        }
    }

    /// §4.6.4: route, spawn, and record a claim's first (or retried) attempt.
    async fn process_claim(self: &Arc<Self>, claim: Claim, attempts: u32) {
        {
            let mut inner = self.inner.lock().await;
            inner.processing_claims.insert(claim.id);
        }

        let permit = match Arc::clone(&self.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.lock().await.processing_claims.remove(&claim.id);
                return;
            }
        };

        let ctx = RoutingContext {
            title: claim.title.clone(),
            description: claim.description.clone(),
            labels: claim.labels(),
        };
        let routing = self.router.route(&ctx).await;

        let agent_id = format!("{}-{}", routing.agent_type, random_suffix());
        let context = claim.context.clone().or_else(|| claim.description.clone());

        let workspace = match &self.worktrees {
            Some(manager) if self.config.use_worktrees => manager.ensure_workspace(&claim.issue_id).await,
            _ => crate::isolation::Workspace {
                path: self.config.working_dir.clone(),
                branch: None,
                is_main_repo: true,
            },
        };

        let mut args = self.config.worker_args.clone();
        if let Some(ref ctx_text) = context {
            args.push(ctx_text.clone());
        }

        let options = SpawnOptions {
            agent_id: agent_id.clone(),
            claim_id: claim.id,
            issue_id: claim.issue_id.clone(),
            command: self.config.worker_command.clone(),
            args,
            workspace_path: workspace.path,
            dashboard_url: self.config.dashboard_url.clone(),
            dashboard_hook_url: format!("{}/api/hooks/agent", self.config.dashboard_url),
            cleanup_on_success: self.config.cleanup_worktrees,
        };

        let result = self.spawner.spawn(options).await;

        {
            let mut inner = self.inner.lock().await;
            inner.processing_claims.remove(&claim.id);
            inner.counters.processed += 1;
        }

        if !result.success {
            drop(permit);
            let error = result.error.unwrap_or_else(|| "spawn failed".to_string());
            self.handle_claim_failure(claim.id, claim.issue_id, attempts, error).await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.active_agents.insert(
                agent_id.clone(),
                SpawnedAgent {
                    agent_id: agent_id.clone(),
                    agent_type: routing.agent_type.clone(),
                    model_tier: routing.model_tier,
                    claim_id: claim.id,
                    issue_id: claim.issue_id.clone(),
                    status: SpawnedAgentStatus::Spawning,
                    attempts,
                    max_attempts: self.config.max_retries + 1,
                    last_error: None,
                    spawned_at: Utc::now(),
                    completed_at: None,
                    permit,
                },
            );
        }

        if let Err(err) = self.dashboard.claim_issue(claim.id, &agent_id, &routing.agent_type).await {
            warn!(error = %err, claim_id = %claim.id, "failed to mark claim as claimed");
        }

        self.emit(OrchestratorEvent::AgentSpawned {
            agent_id: agent_id.clone(),
            claim_id: claim.id,
        });
        self.emit(OrchestratorEvent::ClaimAssigned { claim_id: claim.id, agent_id });

        if self.capacity.available_permits() == 0 {
            self.emit(OrchestratorEvent::PoolCapacityReached);
        }
    }

    /// §4.6.5: decide retry vs terminal failure.
    async fn handle_claim_failure(&self, claim_id: Uuid, issue_id: String, attempts: u32, error: String) {
        let will_retry = attempts <= self.config.max_retries;

        if will_retry {
            // `claim_issue` left the claim `active`; `process_retry_queue`
            // only re-feeds claims still in `backlog`/`blocked`, so the
            // claim has to be released back to `backlog` here or the retry
            // it's about to schedule would never pass that filter.
            if let Err(err) = self.dashboard.release_claim(claim_id).await {
                warn!(error = %err, %claim_id, "failed to release claim before scheduling retry");
            }

            let delay_ms = backoff_delay_ms(self.config.base_retry_delay_ms, attempts - 1);
            let mut inner = self.inner.lock().await;
            inner.retry_queue.push(RetryEntry {
                claim_id,
                issue_id,
                attempts,
                next_retry_at: Instant::now() + Duration::from_millis(delay_ms),
                last_error: Some(error),
            });
        } else {
            let mut inner = self.inner.lock().await;
            inner.counters.failed += 1;
            drop(inner);
            if let Err(err) = self.dashboard.mark_blocked(claim_id).await {
                warn!(error = %err, %claim_id, "failed to mark claim blocked after exhausting retries");
            }
        }

        self.emit(OrchestratorEvent::AgentFailed {
            agent_id: String::new(),
            will_retry,
        });
    }

    async fn process_retry_queue(self: &Arc<Self>) {
        let due: Vec<RetryEntry> = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            let (due, pending): (Vec<_>, Vec<_>) =
                inner.retry_queue.drain(..).partition(|e| e.next_retry_at <= now);
            inner.retry_queue = pending;
            due
        };

        for entry in due {
            let claim = match self.dashboard.get_claim(entry.claim_id).await {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, claim_id = %entry.claim_id, "failed to refetch claim for retry");
                    self.handle_claim_failure(entry.claim_id, entry.issue_id, entry.attempts + 1, err.to_string()).await;
                    continue;
                }
            };

            if !matches!(claim.status, ClaimStatus::Backlog | ClaimStatus::Blocked) {
                continue;
            }

            self.process_claim(claim, entry.attempts + 1).await;
        }
    }

    /// §4.6.6: stream observer for `claim.*` events arriving over the
    /// dashboard WebSocket (agent lifecycle instead arrives via
    /// `handle_agent_event`, fed directly from the spawner's channel).
    pub async fn handle_stream_message(self: &Arc<Self>, frame: ServerFrame) {
        use crate::events::DashboardEvent;

        let ServerFrame::Event { event } = frame else {
            return;
        };

        match event {
            DashboardEvent::ClaimCreated { claim } | DashboardEvent::ClaimUpdated { claim, .. } => {
                if claim.status != ClaimStatus::Backlog {
                    return;
                }
                if self.status().await != OrchestratorStatus::Running {
                    return;
                }
                if self.capacity.available_permits() == 0 {
                    return;
                }
                let already_tracked = {
                    let inner = self.inner.lock().await;
                    inner.processing_claims.contains(&claim.id)
                        || inner.retry_queue.iter().any(|r| r.claim_id == claim.id)
                };
                if !already_tracked {
                    self.process_claim(claim, 1).await;
                }
            }
            _ => {}
        }
    }

    /// Agent lifecycle events arrive directly from `AgentSpawner`'s channel.
    pub async fn handle_agent_event(self: &Arc<Self>, event: AgentEvent) {
        match event {
            AgentEvent::Progress { agent_id, percent } => {
                let claim_id = {
                    let mut inner = self.inner.lock().await;
                    let Some(agent) = inner.active_agents.get_mut(&agent_id) else {
                        return;
                    };
                    if SpawnedAgentStateMachine::is_valid_transition(agent.status, SpawnedAgentStatus::Running) {
                        agent.status = SpawnedAgentStatus::Running;
                    }
                    agent.claim_id
                };
                if let Err(err) = self.dashboard.update_claim_progress(claim_id, percent as i32).await {
                    warn!(error = %err, %claim_id, "best-effort progress update failed");
                }
            }
            // Per-line output is routed to dashboard observers by the
            // aggregator directly off the spawner's channel; the
            // orchestrator's own state machine has nothing to update here.
            AgentEvent::Log { .. } => {}
            AgentEvent::Completed { agent_id, .. } => {
                let claim_id = {
                    let mut inner = self.inner.lock().await;
                    let Some(mut agent) = inner.active_agents.remove(&agent_id) else {
                        return;
                    };
                    agent.status = SpawnedAgentStatus::Completed;
                    agent.completed_at = Some(Utc::now());
                    agent.claim_id
                };
                self.inner.lock().await.counters.succeeded += 1;
                if let Err(err) = self.dashboard.mark_review_requested(claim_id).await {
                    warn!(error = %err, %claim_id, "failed to mark claim review-requested on completion");
                }
                self.emit(OrchestratorEvent::AgentCompleted { agent_id });
                self.check_shutdown_drained().await;
            }
            AgentEvent::Failed { agent_id, error } => {
                let agent = {
                    let mut inner = self.inner.lock().await;
                    inner.active_agents.remove(&agent_id)
                };
                if let Some(agent) = agent {
                    self.handle_claim_failure(agent.claim_id, agent.issue_id, agent.attempts + 1, error).await;
                } else {
                    error!(agent_id, "failed event for an agent not in the live table");
                }
                self.check_shutdown_drained().await;
            }
        }
    }

    async fn check_shutdown_drained(&self) {
        let idle = self.status().await == OrchestratorStatus::Stopped
            && self.inner.lock().await.active_agents.is_empty();
        if idle {
            self.shutdown.notify_waiters();
        }
    }

    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = OrchestratorStateMachine::pause(inner.status);
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = OrchestratorStateMachine::resume(inner.status);
    }

    /// §4.6.7: transition to stopped, stop tickers, drain live agents with
    /// a deadline, then force-terminate whatever remains.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.status = OrchestratorStateMachine::stop(inner.status);
        }

        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_handle.lock().await.take() {
            handle.abort();
        }

        // Register interest in the notification before checking whether
        // agents are still live, so a completion racing this check between
        // `active_agents.is_empty()` and the `.await` below can't fire
        // `notify_waiters()` into a future nobody is listening to yet.
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let still_live = !self.inner.lock().await.active_agents.is_empty();
        if still_live {
            let deadline = Duration::from_millis(self.config.graceful_shutdown_ms);
            if tokio::time::timeout(deadline, notified).await.is_err() {
                warn!("graceful shutdown deadline exceeded, force-terminating remaining agents");
                self.spawner.terminate_all().await;
                self.inner.lock().await.active_agents.clear();
            }
        }

        self.emit(OrchestratorEvent::Stopped);
        info!("orchestrator stopped");
    }
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempt_and_stays_capped() {
        let d0 = backoff_delay_ms(1000, 0);
        let d5 = backoff_delay_ms(1000, 5);
        assert!(d0 >= 1000);
        assert!(d5 > d0);
        let ceiling = (RETRY_BACKOFF_CAP_MS as f64 * (1.0 + RETRY_JITTER_FRACTION)) as u64;
        for attempt in 0..20 {
            assert!(backoff_delay_ms(1000, attempt) <= ceiling);
        }
    }

    #[test]
    fn random_suffix_is_six_chars() {
        assert_eq!(random_suffix().len(), 6);
    }
}
