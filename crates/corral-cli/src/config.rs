//! Environment-variable configuration resolution (see SPEC_FULL.md §6.5).
//!
//! File-based configuration is explicitly out of scope; every setting here
//! resolves from a CLI flag falling back to an environment variable.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use corral_core::orchestrator::OrchestratorConfig;
use corral_db::config::DbConfig;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} is not a valid value: {raw:?}"))
            .with_context(|| format!("failed to parse {name}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("{name} must be a boolean, got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

/// Resolve `OrchestratorConfig` from the environment, applying the
/// documented defaults for everything except `DASHBOARD_URL`, which is
/// required.
pub fn resolve_orchestrator_config(
    dashboard_url_flag: Option<&str>,
    worker_command: String,
    worker_args: Vec<String>,
) -> Result<OrchestratorConfig> {
    let dashboard_url = dashboard_url_flag
        .map(str::to_string)
        .or_else(|| std::env::var("DASHBOARD_URL").ok())
        .context("DASHBOARD_URL is required (set the env var or pass --dashboard-url)")?;

    let dashboard_ws_url = std::env::var("DASHBOARD_WS_URL").unwrap_or_else(|_| derive_ws_url(&dashboard_url));

    let working_dir = match std::env::var("WORKING_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir().context("failed to read current directory")?,
    };

    Ok(OrchestratorConfig {
        dashboard_url,
        dashboard_ws_url,
        max_agents: env_parse("MAX_AGENTS", 3usize)?,
        max_retries: env_parse("MAX_RETRIES", 2u32)?,
        base_retry_delay_ms: env_parse("BASE_RETRY_DELAY_MS", 1000u64)?,
        poll_interval_ms: env_parse("POLL_INTERVAL_MS", 5000u64)?,
        graceful_shutdown_ms: env_parse("GRACEFUL_SHUTDOWN_MS", 30_000u64)?,
        working_dir,
        use_worktrees: env_bool("USE_WORKTREES", true)?,
        cleanup_worktrees: env_bool("CLEANUP_WORKTREES", false)?,
        worker_command,
        worker_args,
    })
}

/// Derive a `ws(s)://` URL from an `http(s)://` dashboard base URL when
/// `DASHBOARD_WS_URL` is unset, pointing at the hub's `/api/ws` upgrade.
fn derive_ws_url(dashboard_url: &str) -> String {
    let (scheme, rest) = if let Some(rest) = dashboard_url.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = dashboard_url.strip_prefix("http://") {
        ("ws", rest)
    } else {
        ("ws", dashboard_url)
    };
    let rest = rest.trim_end_matches('/');
    format!("{scheme}://{rest}/api/ws")
}

pub fn db_config_from_env() -> DbConfig {
    DbConfig::from_env()
}

pub fn bind_addr() -> String {
    env_or("BIND_ADDR", "0.0.0.0:8080")
}
