//! Row and domain types backing the `claims` table.
//!
//! `ClaimRow` is the literal shape sqlx can fetch (flattened claimant
//! columns, since Postgres has no native tagged-union column type); `Claim`
//! is the domain type with `claimant` folded back into a single
//! discriminated union. Conversion happens at the query boundary so nothing
//! downstream of `corral-db::queries` ever sees the flattened shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Where a claim originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    Github,
    Manual,
    Mcp,
}

impl fmt::Display for ClaimSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimSource::Github => "github",
            ClaimSource::Manual => "manual",
            ClaimSource::Mcp => "mcp",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid claim source: {0}")]
pub struct ParseClaimSourceError(String);

impl FromStr for ClaimSource {
    type Err = ParseClaimSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(ClaimSource::Github),
            "manual" => Ok(ClaimSource::Manual),
            "mcp" => Ok(ClaimSource::Mcp),
            other => Err(ParseClaimSourceError(other.to_string())),
        }
    }
}

/// A claim's lifecycle status.
///
/// `ReviewRequested` is the sole completion target (see `isRevision`
/// discussion in DESIGN.md — the upstream `needs_review` name never
/// appears here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ClaimStatus {
    Backlog,
    Active,
    Paused,
    Blocked,
    ReviewRequested,
    Completed,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Backlog => "backlog",
            ClaimStatus::Active => "active",
            ClaimStatus::Paused => "paused",
            ClaimStatus::Blocked => "blocked",
            ClaimStatus::ReviewRequested => "review-requested",
            ClaimStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid claim status: {0}")]
pub struct ParseClaimStatusError(String);

impl FromStr for ClaimStatus {
    type Err = ParseClaimStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(ClaimStatus::Backlog),
            "active" => Ok(ClaimStatus::Active),
            "paused" => Ok(ClaimStatus::Paused),
            "blocked" => Ok(ClaimStatus::Blocked),
            "review-requested" => Ok(ClaimStatus::ReviewRequested),
            "completed" => Ok(ClaimStatus::Completed),
            other => Err(ParseClaimStatusError(other.to_string())),
        }
    }
}

/// Who currently owns a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Claimant {
    Human { user_id: String, name: String },
    Agent { agent_id: String, agent_type: String },
}

impl Claimant {
    /// Serialize to the compact colon-delimited wire form used by the
    /// worker hook payloads: `human:<id>:<name>` or `agent:<id>:<type>`.
    pub fn serialize_compact(&self) -> String {
        match self {
            Claimant::Human { user_id, name } => format!("human:{user_id}:{name}"),
            Claimant::Agent {
                agent_id,
                agent_type,
            } => format!("agent:{agent_id}:{agent_type}"),
        }
    }

    /// Parse the compact colon-delimited wire form.
    pub fn parse_compact(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next()?;
        let id = parts.next()?;
        let rest = parts.next()?;
        match kind {
            "human" => Some(Claimant::Human {
                user_id: id.to_string(),
                name: rest.to_string(),
            }),
            "agent" => Some(Claimant::Agent {
                agent_id: id.to_string(),
                agent_type: rest.to_string(),
            }),
            _ => None,
        }
    }
}

/// The literal row shape fetched from Postgres: claimant columns flattened.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ClaimRow {
    pub id: Uuid,
    pub issue_id: String,
    pub source: ClaimSource,
    pub source_ref: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: ClaimStatus,
    pub claimant_type: Option<String>,
    pub claimant_user_id: Option<String>,
    pub claimant_name: Option<String>,
    pub claimant_agent_id: Option<String>,
    pub claimant_agent_type: Option<String>,
    pub progress: i32,
    pub context: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClaimRow {
    pub(crate) fn into_claim(self) -> Claim {
        let claimant = match self.claimant_type.as_deref() {
            Some("human") => Some(Claimant::Human {
                user_id: self.claimant_user_id.unwrap_or_default(),
                name: self.claimant_name.unwrap_or_default(),
            }),
            Some("agent") => Some(Claimant::Agent {
                agent_id: self.claimant_agent_id.unwrap_or_default(),
                agent_type: self.claimant_agent_type.unwrap_or_default(),
            }),
            _ => None,
        };

        Claim {
            id: self.id,
            issue_id: self.issue_id,
            source: self.source,
            source_ref: self.source_ref,
            title: self.title,
            description: self.description,
            status: self.status,
            claimant,
            progress: self.progress,
            context: self.context,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A unit of work routed to, and tracked through, a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub issue_id: String,
    pub source: ClaimSource,
    pub source_ref: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: ClaimStatus,
    pub claimant: Option<Claimant>,
    pub progress: i32,
    pub context: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    /// Whether `Claim.metadata.isRevision` is set truthy — the single
    /// canonical post-review revision flag (see DESIGN.md open question 3).
    pub fn is_revision(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("isRevision"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// `Claim.metadata.labels`, if present and an array of strings. There is
    /// no dedicated `labels` column; this is the routing stage's only source
    /// for them (see DESIGN.md).
    pub fn labels(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("labels"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Data required to create a new claim.
#[derive(Debug, Clone, Deserialize)]
pub struct NewClaim {
    pub issue_id: String,
    pub source: ClaimSource,
    pub source_ref: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub context: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Filter for listing claims. An empty filter matches every claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub status: Vec<ClaimStatus>,
    pub source: Option<ClaimSource>,
    pub claimant_type: Option<String>,
}

/// A partial update applied via `PATCH /api/claims/:id`.
///
/// `claimant`/`context`/`metadata` are `Option<Option<T>>` so a field can be
/// left untouched (absent from the JSON body), explicitly cleared (`null`),
/// or set (a value) — ordinary `Option<T>` can't distinguish the first two.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimPatch {
    #[serde(default)]
    pub status: Option<ClaimStatus>,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default, deserialize_with = "double_option")]
    pub claimant: Option<Option<Claimant>>,
    #[serde(default, deserialize_with = "double_option")]
    pub context: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub metadata: Option<Option<serde_json::Value>>,
}

/// Distinguishes an absent JSON field (outer `None`) from an explicit `null`
/// (`Some(None)`) from a present value (`Some(Some(value))`).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_status_round_trip() {
        for s in [
            ClaimStatus::Backlog,
            ClaimStatus::Active,
            ClaimStatus::Paused,
            ClaimStatus::Blocked,
            ClaimStatus::ReviewRequested,
            ClaimStatus::Completed,
        ] {
            let text = s.to_string();
            assert_eq!(ClaimStatus::from_str(&text).unwrap(), s);
        }
    }

    #[test]
    fn claimant_compact_round_trip_human() {
        let c = Claimant::Human {
            user_id: "u1".into(),
            name: "Ada".into(),
        };
        let s = c.serialize_compact();
        assert_eq!(s, "human:u1:Ada");
        assert_eq!(Claimant::parse_compact(&s), Some(c));
    }

    #[test]
    fn claimant_compact_round_trip_agent() {
        let c = Claimant::Agent {
            agent_id: "coder-ab12cd".into(),
            agent_type: "coder".into(),
        };
        let s = c.serialize_compact();
        assert_eq!(s, "agent:coder-ab12cd:coder");
        assert_eq!(Claimant::parse_compact(&s), Some(c));
    }

    #[test]
    fn is_revision_defaults_false() {
        let claim = Claim {
            id: Uuid::new_v4(),
            issue_id: "T-1".into(),
            source: ClaimSource::Manual,
            source_ref: None,
            title: "x".into(),
            description: None,
            status: ClaimStatus::Backlog,
            claimant: None,
            progress: 0,
            context: None,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!claim.is_revision());
    }

    #[test]
    fn is_revision_reads_metadata_flag() {
        let mut claim = Claim {
            id: Uuid::new_v4(),
            issue_id: "T-1".into(),
            source: ClaimSource::Manual,
            source_ref: None,
            title: "x".into(),
            description: None,
            status: ClaimStatus::Backlog,
            claimant: None,
            progress: 0,
            context: None,
            metadata: Some(serde_json::json!({"isRevision": true})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(claim.is_revision());
        claim.metadata = Some(serde_json::json!({"isRevision": false}));
        assert!(!claim.is_revision());
    }
}
