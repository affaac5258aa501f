//! Normalizes storage deltas, worker hook payloads, and worker stdout lines
//! into a single uniform `DashboardEvent` stream, fanned out to listeners.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use corral_db::storage::StorageEvent;

use crate::events::{AgentResult, DashboardEvent, LogLevel};
use crate::spawner::AgentEvent;

/// The body of `POST /api/hooks/agent`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerHook {
    pub agent_id: String,
    pub claim_id: Uuid,
    pub issue_id: String,
    pub event: HookEventKind,
    pub progress: Option<u32>,
    pub error: Option<String>,
    pub result: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEventKind {
    AgentSpawn,
    PostTask,
    PostEdit,
    PostCommand,
    AgentTerminate,
}

type Listener = Box<dyn Fn(&DashboardEvent) + Send + Sync>;

/// Fans normalized events out to a set of listeners, isolating listener
/// panics so one bad subscriber cannot stop delivery to the rest.
#[derive(Clone, Default)]
pub struct EventAggregator {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_listener(&self, listener: Listener) {
        self.listeners.write().await.push(listener);
    }

    async fn emit(&self, event: DashboardEvent) {
        let guard = self.listeners.read().await;
        for listener in guard.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!("dashboard event listener panicked; continuing delivery");
            }
        }
    }

    pub async fn handle_storage_event(&self, event: StorageEvent) {
        let mapped = match event {
            StorageEvent::Created { claim } => DashboardEvent::ClaimCreated { claim },
            StorageEvent::Updated { claim, changes } => {
                DashboardEvent::ClaimUpdated { claim, changes }
            }
            StorageEvent::Deleted { issue_id } => DashboardEvent::ClaimDeleted { issue_id },
        };
        self.emit(mapped).await;
    }

    pub async fn handle_worker_hook(&self, hook: WorkerHook) {
        match hook.event {
            HookEventKind::AgentSpawn => {
                self.emit(DashboardEvent::AgentStarted {
                    agent_id: hook.agent_id,
                    agent_type: hook.agent_type.unwrap_or_default(),
                    issue_id: Some(hook.issue_id),
                })
                .await;
            }
            HookEventKind::PostTask => {
                let progress = hook.progress.unwrap_or(0);
                self.emit(DashboardEvent::AgentProgress {
                    agent_id: hook.agent_id.clone(),
                    issue_id: Some(hook.issue_id.clone()),
                    progress,
                })
                .await;
                if progress >= 100 || hook.result.as_deref() == Some("success") {
                    self.emit(DashboardEvent::AgentCompleted {
                        agent_id: hook.agent_id,
                        result: AgentResult::Success,
                        issue_id: Some(hook.issue_id),
                    })
                    .await;
                }
            }
            HookEventKind::PostEdit => {
                self.emit(DashboardEvent::AgentLog {
                    agent_id: hook.agent_id,
                    level: LogLevel::Info,
                    message: hook.error.unwrap_or_else(|| "edit applied".to_string()),
                    timestamp: hook.timestamp,
                })
                .await;
            }
            HookEventKind::PostCommand => {
                let level = match hook.exit_code {
                    Some(0) | None => LogLevel::Info,
                    Some(_) => LogLevel::Error,
                };
                self.emit(DashboardEvent::AgentLog {
                    agent_id: hook.agent_id,
                    level,
                    message: hook.error.unwrap_or_else(|| "command executed".to_string()),
                    timestamp: hook.timestamp,
                })
                .await;
            }
            HookEventKind::AgentTerminate => {
                let result = match hook.result.as_deref() {
                    Some("failure") => AgentResult::Failure,
                    _ => AgentResult::Success,
                };
                self.emit(DashboardEvent::AgentCompleted {
                    agent_id: hook.agent_id,
                    result,
                    issue_id: Some(hook.issue_id),
                })
                .await;
            }
        }
    }

    pub async fn handle_agent_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::Progress { agent_id, percent } => {
                self.emit(DashboardEvent::AgentProgress {
                    agent_id,
                    issue_id: None,
                    progress: percent,
                })
                .await;
            }
            AgentEvent::Log { agent_id, level, line } => {
                self.emit(DashboardEvent::AgentLog {
                    agent_id,
                    level: match level {
                        crate::spawner::LogLevel::Info => LogLevel::Info,
                        crate::spawner::LogLevel::Warn => LogLevel::Warn,
                        crate::spawner::LogLevel::Error => LogLevel::Error,
                    },
                    message: line,
                    timestamp: Utc::now(),
                })
                .await;
            }
            AgentEvent::Completed {
                agent_id,
                trailing_stdout,
            } => {
                self.emit(DashboardEvent::AgentLog {
                    agent_id: agent_id.clone(),
                    level: LogLevel::Info,
                    message: trailing_stdout,
                    timestamp: Utc::now(),
                })
                .await;
                self.emit(DashboardEvent::AgentCompleted {
                    agent_id,
                    result: AgentResult::Success,
                    issue_id: None,
                })
                .await;
            }
            AgentEvent::Failed { agent_id, error } => {
                self.emit(DashboardEvent::AgentLog {
                    agent_id: agent_id.clone(),
                    level: LogLevel::Error,
                    message: error,
                    timestamp: Utc::now(),
                })
                .await;
                self.emit(DashboardEvent::AgentCompleted {
                    agent_id,
                    result: AgentResult::Failure,
                    issue_id: None,
                })
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn storage_created_maps_to_claim_created() {
        let aggregator = EventAggregator::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);
        aggregator
            .add_listener(Box::new(move |event| {
                if matches!(event, DashboardEvent::ClaimCreated { .. }) {
                    received2.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .await;

        let claim = corral_db::models::Claim {
            id: Uuid::new_v4(),
            issue_id: "T-1".into(),
            source: corral_db::models::ClaimSource::Manual,
            source_ref: None,
            title: "x".into(),
            description: None,
            status: corral_db::models::ClaimStatus::Backlog,
            claimant: None,
            progress: 0,
            context: None,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        aggregator
            .handle_storage_event(StorageEvent::Created { claim })
            .await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery() {
        let aggregator = EventAggregator::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);

        aggregator
            .add_listener(Box::new(|_event| panic!("boom")))
            .await;
        aggregator
            .add_listener(Box::new(move |_event| {
                received2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        aggregator
            .handle_storage_event(StorageEvent::Deleted {
                issue_id: "T-1".into(),
            })
            .await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
