//! The uniform event type that flows from storage/workers through the
//! aggregator to the subscription hub and every connected observer.

use serde::{Deserialize, Serialize};

use corral_db::models::Claim;

/// A normalized claim or agent lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    #[serde(rename = "claim.created")]
    ClaimCreated { claim: Claim },
    #[serde(rename = "claim.updated")]
    ClaimUpdated { claim: Claim, changes: Vec<String> },
    #[serde(rename = "claim.deleted")]
    ClaimDeleted { issue_id: String },
    #[serde(rename = "claim.handoff")]
    ClaimHandoff {
        from: String,
        to: String,
        issue_id: String,
    },
    #[serde(rename = "agent.started")]
    AgentStarted {
        agent_id: String,
        agent_type: String,
        issue_id: Option<String>,
    },
    #[serde(rename = "agent.progress")]
    AgentProgress {
        agent_id: String,
        issue_id: Option<String>,
        progress: u32,
    },
    #[serde(rename = "agent.log")]
    AgentLog {
        agent_id: String,
        level: LogLevel,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        agent_id: String,
        result: AgentResult,
        issue_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentResult {
    Success,
    Failure,
}

/// Which rooms an event is broadcast to. Pure function, the deterministic
/// routing contract the subscription hub relies on.
pub fn event_rooms(event: &DashboardEvent) -> Vec<String> {
    match event {
        DashboardEvent::ClaimCreated { claim } => {
            vec!["board".to_string(), format!("claim:{}", claim.issue_id)]
        }
        DashboardEvent::ClaimUpdated { claim, .. } => {
            vec!["board".to_string(), format!("claim:{}", claim.issue_id)]
        }
        DashboardEvent::ClaimDeleted { issue_id } => {
            vec!["board".to_string(), format!("claim:{issue_id}")]
        }
        DashboardEvent::ClaimHandoff { issue_id, .. } => {
            vec!["board".to_string(), format!("claim:{issue_id}")]
        }
        DashboardEvent::AgentStarted { agent_id, .. } => {
            vec!["logs".to_string(), format!("agent:{agent_id}")]
        }
        DashboardEvent::AgentProgress { agent_id, .. } => {
            vec!["logs".to_string(), format!("agent:{agent_id}")]
        }
        DashboardEvent::AgentLog { agent_id, .. } => {
            vec!["logs".to_string(), format!("agent:{agent_id}")]
        }
        DashboardEvent::AgentCompleted { agent_id, .. } => {
            vec!["logs".to_string(), format!("agent:{agent_id}")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_events_route_to_board_and_claim_room() {
        let event = DashboardEvent::ClaimDeleted {
            issue_id: "T-1".to_string(),
        };
        assert_eq!(event_rooms(&event), vec!["board", "claim:T-1"]);
    }

    #[test]
    fn agent_events_route_to_logs_and_agent_room() {
        let event = DashboardEvent::AgentStarted {
            agent_id: "coder-ab12cd".to_string(),
            agent_type: "coder".to_string(),
            issue_id: None,
        };
        assert_eq!(event_rooms(&event), vec!["logs", "agent:coder-ab12cd"]);
    }
}
