//! Maps a claim's `(title, description, labels)` to an agent archetype and
//! capability tier. Two-stage: an optional external advisor subprocess,
//! falling back to a fixed heuristic table. Never fails — a total failure
//! still returns a valid default routing.

use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const ADVISOR_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("routing advisor failed to launch: {0}")]
    Launch(#[source] std::io::Error),
    #[error("routing advisor timed out")]
    Timeout,
    #[error("routing advisor exited with a non-zero status")]
    NonZeroExit,
    #[error("routing advisor returned malformed JSON: {0}")]
    MalformedResponse(#[source] serde_json::Error),
}

/// Capability tier, ordered from least to most capable. `Wasm` and `Haiku`
/// exist as named rungs (glossary: `wasm < haiku < sonnet < opus`) but the
/// router itself never selects below `Sonnet` — see `ModelTier::floor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelTier {
    Wasm,
    Haiku,
    Sonnet,
    Opus,
}

impl ModelTier {
    /// The floor tier the heuristic fallback (and advisor normalization)
    /// never goes below: haiku is documented as insufficient for
    /// tool-using tasks.
    pub const fn floor() -> ModelTier {
        ModelTier::Sonnet
    }

    fn from_synonym(raw: &str) -> ModelTier {
        match raw.to_ascii_lowercase().as_str() {
            "wasm" => ModelTier::Wasm,
            "haiku" | "fast" => ModelTier::Haiku,
            "sonnet" | "balanced" => ModelTier::Sonnet,
            "opus" | "premium" | "complex" => ModelTier::Opus,
            _ => ModelTier::floor(),
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelTier::Wasm => "wasm",
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Opus => "opus",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ModelTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ModelTier::from_synonym(s))
    }
}

/// Input to a routing decision.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub title: String,
    pub description: Option<String>,
    pub labels: Vec<String>,
}

impl RoutingContext {
    fn combined_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(ref desc) = self.description {
            text.push(' ');
            text.push_str(desc);
        }
        text.push(' ');
        text.push_str(&self.labels.join(" "));
        text.to_ascii_lowercase()
    }
}

/// The result of routing a claim to a worker.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub agent_type: String,
    pub model_tier: ModelTier,
    pub use_booster: bool,
    pub confidence: f32,
    pub reasoning: String,
}

/// The JSON an external advisor subprocess is expected to emit on stdout.
#[derive(Debug, Deserialize)]
struct AdvisorResponse {
    agent_type: String,
    model_tier: String,
    #[serde(default)]
    use_booster: bool,
    #[serde(default)]
    reasoning: Option<String>,
}

/// An external routing helper: a subprocess that accepts the routing
/// context as JSON on stdin and returns a decision as JSON on stdout.
#[async_trait]
pub trait RoutingAdvisor: Send + Sync {
    async fn advise(&self, ctx: &RoutingContext) -> Result<AdvisorResponseOwned, RouterError>;
}

/// Advisor decision, normalized archetype/tier synonyms already applied.
#[derive(Debug, Clone)]
pub struct AdvisorResponseOwned {
    pub agent_type: String,
    pub model_tier: ModelTier,
    pub use_booster: bool,
    pub reasoning: Option<String>,
}

/// Invokes a configured external command as the routing advisor.
pub struct SubprocessAdvisor {
    command: String,
    args: Vec<String>,
}

impl SubprocessAdvisor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl RoutingAdvisor for SubprocessAdvisor {
    async fn advise(&self, ctx: &RoutingContext) -> Result<AdvisorResponseOwned, RouterError> {
        let payload = serde_json::json!({
            "title": ctx.title,
            "description": ctx.description,
            "labels": ctx.labels,
        });

        let run = async {
            let mut child = Command::new(&self.command)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(RouterError::Launch)?;

            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(payload.to_string().as_bytes()).await;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(RouterError::Launch)?;

            if !output.status.success() {
                return Err(RouterError::NonZeroExit);
            }

            let parsed: AdvisorResponse =
                serde_json::from_slice(&output.stdout).map_err(RouterError::MalformedResponse)?;

            Ok(AdvisorResponseOwned {
                agent_type: normalize_archetype(&parsed.agent_type),
                model_tier: ModelTier::from_synonym(&parsed.model_tier),
                use_booster: parsed.use_booster,
                reasoning: parsed.reasoning,
            })
        };

        match tokio::time::timeout(ADVISOR_DEADLINE, run).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::Timeout),
        }
    }
}

/// Fixed synonym table for archetype names returned by an advisor or found
/// in labels: `developer|programmer -> coder`, etc. Anything not listed
/// passes through lower-cased, since archetype is a free-form label, not a
/// closed enum.
fn normalize_archetype(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "developer" | "programmer" | "engineer" => "coder".to_string(),
        "qa" => "tester".to_string(),
        other => other.to_string(),
    }
}

/// Label -> archetype table, checked before any title pattern.
const LABEL_TABLE: &[(&str, &str)] = &[
    ("bug", "coder"),
    ("feature", "coder"),
    ("enhancement", "coder"),
    ("test", "tester"),
    ("qa", "tester"),
    ("research", "researcher"),
    ("investigation", "researcher"),
    ("review", "reviewer"),
    ("design", "architect"),
    ("architecture", "architect"),
];

/// Ordered title-substring patterns; first match wins. Plain substring
/// matching rather than a `regex` dependency, matching the corpus's
/// preference for hand-rolled parsing over a regex engine where a fixed
/// literal table suffices.
const TITLE_PATTERNS: &[(&str, &str)] = &[
    ("fix", "coder"),
    ("bug", "coder"),
    ("implement", "coder"),
    ("add", "coder"),
    ("refactor", "coder"),
    ("test", "tester"),
    ("research", "researcher"),
    ("investigate", "researcher"),
    ("review", "reviewer"),
    ("architect", "architect"),
    ("design", "architect"),
];

/// Substrings that upgrade the tier from the floor (`sonnet`) to `opus`.
const HIGH_COMPLEXITY_KEYWORDS: &[&str] = &[
    "security",
    "performance",
    "architect",
    "critical",
    "breaking",
    "migration",
];

fn heuristic_route(ctx: &RoutingContext) -> RoutingResult {
    let combined = ctx.combined_text();

    let mut agent_type = None;
    let mut confidence = 0.5;
    let mut reasoning = "no label or pattern match, using default".to_string();

    for label in &ctx.labels {
        let label = label.to_ascii_lowercase();
        if let Some((_, archetype)) = LABEL_TABLE.iter().find(|(key, _)| *key == label) {
            agent_type = Some(archetype.to_string());
            confidence = 0.7;
            reasoning = format!("label '{label}' matched archetype '{archetype}'");
            break;
        }
    }

    if agent_type.is_none() {
        let title_lower = ctx.title.to_ascii_lowercase();
        for (pattern, archetype) in TITLE_PATTERNS {
            if title_lower.contains(pattern) {
                agent_type = Some(archetype.to_string());
                confidence = 0.6;
                reasoning = format!("title pattern '{pattern}' matched archetype '{archetype}'");
                break;
            }
        }
    }

    let agent_type = agent_type.unwrap_or_else(|| "coder".to_string());

    let mut model_tier = ModelTier::floor();
    let high_complexity = HIGH_COMPLEXITY_KEYWORDS
        .iter()
        .find(|kw| combined.contains(*kw));
    if let Some(keyword) = high_complexity {
        model_tier = ModelTier::Opus;
        reasoning = format!("{reasoning}; upgraded to opus on high-complexity keyword '{keyword}'");
    }

    RoutingResult {
        agent_type,
        model_tier,
        use_booster: false,
        confidence,
        reasoning,
    }
}

/// Two-stage `(title, description, labels) -> (archetype, tier, confidence)`
/// router. Never fails: `route` always returns a usable `RoutingResult`.
pub struct TaskRouter {
    advisor: Option<Box<dyn RoutingAdvisor>>,
    /// Latched `false -> true` once: the advisor is marked unavailable for
    /// the remainder of the process lifetime after any error.
    advisor_unavailable: AtomicBool,
}

impl TaskRouter {
    pub fn new(advisor: Option<Box<dyn RoutingAdvisor>>) -> Self {
        Self {
            advisor,
            advisor_unavailable: AtomicBool::new(false),
        }
    }

    pub fn heuristic_only() -> Self {
        Self::new(None)
    }

    pub async fn route(&self, ctx: &RoutingContext) -> RoutingResult {
        if let Some(advisor) = &self.advisor {
            if !self.advisor_unavailable.load(Ordering::SeqCst) {
                match advisor.advise(ctx).await {
                    Ok(resp) => {
                        return RoutingResult {
                            agent_type: resp.agent_type,
                            model_tier: resp.model_tier,
                            use_booster: resp.use_booster,
                            confidence: 0.7,
                            reasoning: resp
                                .reasoning
                                .unwrap_or_else(|| "external advisor decision".to_string()),
                        };
                    }
                    Err(err) => {
                        warn!(error = %err, "routing advisor failed, disabling for process lifetime");
                        self.advisor_unavailable.store(true, Ordering::SeqCst);
                    }
                }
            } else {
                debug!("routing advisor previously marked unavailable, skipping");
            }
        }

        heuristic_route(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(title: &str, labels: &[&str]) -> RoutingContext {
        RoutingContext {
            title: title.to_string(),
            description: None,
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn label_match_beats_title_pattern() {
        let router = TaskRouter::heuristic_only();
        let result = router.route(&ctx("fix the thing", &["research"])).await;
        assert_eq!(result.agent_type, "researcher");
        assert_eq!(result.confidence, 0.7);
    }

    #[tokio::test]
    async fn title_pattern_used_when_no_label_matches() {
        let router = TaskRouter::heuristic_only();
        let result = router.route(&ctx("fix the crash on startup", &[])).await;
        assert_eq!(result.agent_type, "coder");
        assert_eq!(result.confidence, 0.6);
    }

    #[tokio::test]
    async fn default_when_nothing_matches() {
        let router = TaskRouter::heuristic_only();
        let result = router.route(&ctx("zzz qqq", &[])).await;
        assert_eq!(result.agent_type, "coder");
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.model_tier, ModelTier::Sonnet);
    }

    #[tokio::test]
    async fn high_complexity_keyword_upgrades_tier() {
        let router = TaskRouter::heuristic_only();
        let result = router
            .route(&ctx("migrate the auth service", &[]))
            .await;
        assert_eq!(result.model_tier, ModelTier::Opus);
    }

    #[test]
    fn model_tier_ordering() {
        assert!(ModelTier::Wasm < ModelTier::Haiku);
        assert!(ModelTier::Haiku < ModelTier::Sonnet);
        assert!(ModelTier::Sonnet < ModelTier::Opus);
    }

    #[test]
    fn model_tier_synonyms() {
        assert_eq!(ModelTier::from_synonym("fast"), ModelTier::Haiku);
        assert_eq!(ModelTier::from_synonym("premium"), ModelTier::Opus);
        assert_eq!(ModelTier::from_synonym("complex"), ModelTier::Opus);
        assert_eq!(ModelTier::from_synonym("unknown"), ModelTier::Sonnet);
    }

    #[test]
    fn archetype_synonyms() {
        assert_eq!(normalize_archetype("developer"), "coder");
        assert_eq!(normalize_archetype("programmer"), "coder");
        assert_eq!(normalize_archetype("qa"), "tester");
        assert_eq!(normalize_archetype("architect"), "architect");
    }
}
