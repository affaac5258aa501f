//! Declarative transition tables for the three state machines this
//! workspace cares about: the orchestrator's own run status, a spawned
//! agent's lifecycle, and a claim's lifecycle. Each is a single `matches!`
//! table plus a handful of semantically-named wrapper functions, mirroring
//! `TaskStateMachine` in the reference workspace.

use thiserror::Error;

use corral_db::models::ClaimStatus;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },
}

/// The orchestrator's own run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

pub struct OrchestratorStateMachine;

impl OrchestratorStateMachine {
    pub fn is_valid_transition(from: OrchestratorStatus, to: OrchestratorStatus) -> bool {
        use OrchestratorStatus::*;
        matches!(
            (from, to),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }

    /// `start`: errors on an invalid transition (e.g. already running).
    pub fn start(current: OrchestratorStatus) -> Result<OrchestratorStatus, StateError> {
        if Self::is_valid_transition(current, OrchestratorStatus::Running) {
            Ok(OrchestratorStatus::Running)
        } else {
            Err(StateError::InvalidTransition {
                from: format!("{current:?}"),
                to: "Running".to_string(),
            })
        }
    }

    /// `pause`/`resume`: invalid transitions are a logged no-op, not an error.
    pub fn pause(current: OrchestratorStatus) -> OrchestratorStatus {
        if Self::is_valid_transition(current, OrchestratorStatus::Paused) {
            OrchestratorStatus::Paused
        } else {
            tracing::warn!(from = ?current, "ignoring pause: not valid from current status");
            current
        }
    }

    pub fn resume(current: OrchestratorStatus) -> OrchestratorStatus {
        if Self::is_valid_transition(current, OrchestratorStatus::Running) {
            OrchestratorStatus::Running
        } else {
            tracing::warn!(from = ?current, "ignoring resume: not valid from current status");
            current
        }
    }

    /// `stop`: terminal from `running` or `paused`; a no-op (already
    /// stopped, or stopping from idle) is also logged rather than erroring,
    /// since shutdown must always be safe to call.
    pub fn stop(current: OrchestratorStatus) -> OrchestratorStatus {
        if Self::is_valid_transition(current, OrchestratorStatus::Stopped) {
            OrchestratorStatus::Stopped
        } else if current == OrchestratorStatus::Stopped {
            current
        } else {
            tracing::warn!(from = ?current, "stopping from an unexpected status");
            OrchestratorStatus::Stopped
        }
    }
}

/// A spawned worker's lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnedAgentStatus {
    Spawning,
    Running,
    Completed,
    Failed,
}

pub struct SpawnedAgentStateMachine;

impl SpawnedAgentStateMachine {
    /// The permissive variant (see DESIGN.md open question 2):
    /// `spawning -> completed` is legal, since a short-lived worker can
    /// exit before any `running` progress event is ever observed.
    pub fn is_valid_transition(from: SpawnedAgentStatus, to: SpawnedAgentStatus) -> bool {
        use SpawnedAgentStatus::*;
        matches!(
            (from, to),
            (Spawning, Running) | (Spawning, Completed) | (Spawning, Failed) |
            (Running, Completed) | (Running, Failed)
        )
    }
}

/// A claim's lifecycle status transitions, driven by CRUD, assignment,
/// progress hooks, completion, and failure (see spec.md §3).
pub struct ClaimStateMachine;

impl ClaimStateMachine {
    pub fn is_valid_transition(from: ClaimStatus, to: ClaimStatus) -> bool {
        use ClaimStatus::*;
        matches!(
            (from, to),
            (Backlog, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Blocked)
                | (Active, Backlog)
                | (Active, ReviewRequested)
                | (Blocked, Backlog)
                | (ReviewRequested, Backlog)
                | (ReviewRequested, Completed)
        )
    }
}
