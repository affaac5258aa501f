//! Ownership of external worker process lifecycle: launch, stream capture,
//! lifecycle events, and termination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RING_CAPACITY_BYTES: usize = 8192;
const FAILURE_TRAILING_BYTES: usize = 500;
const SOFT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("agent {0} is not currently running")]
    NotRunning(String),
    #[error("spawner is shutting down, rejecting new spawns")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub agent_id: String,
    pub claim_id: Uuid,
    pub issue_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub workspace_path: PathBuf,
    pub dashboard_url: String,
    pub dashboard_hook_url: String,
    /// Cleanup the worktree after a successful completion.
    pub cleanup_on_success: bool,
}

#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub success: bool,
    pub agent_id: Option<String>,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// A lifecycle event emitted by a running or terminated agent process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum AgentEvent {
    Progress { agent_id: String, percent: u32 },
    Log { agent_id: String, level: LogLevel, line: String },
    Completed { agent_id: String, trailing_stdout: String },
    Failed { agent_id: String, error: String },
}

/// Severity inferred from a worker's stdout/stderr stream, matching
/// `crate::events::LogLevel`'s wire shape without creating a dependency
/// from this module on the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Infer a severity for a captured output line: stderr lines default to
/// `Warn`, stdout to `Info`, and either is upgraded to `Error` when the
/// line itself looks like a failure report.
fn infer_log_level(line: &str, is_stderr: bool) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("panic") || lower.contains("fatal") {
        LogLevel::Error
    } else if is_stderr {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

/// Tracks a live child without owning it: `monitor` holds the `Child`
/// directly and awaits `wait()` without ever touching this table, so a
/// concurrent `terminate` never blocks on the table lock for the lifetime
/// of the process.
struct RunningProcess {
    #[cfg(unix)]
    pid: i32,
    exited_rx: oneshot::Receiver<()>,
}

/// Owns the live-process table and drives worker subprocess lifecycle.
#[derive(Clone)]
pub struct AgentSpawner {
    processes: Arc<Mutex<HashMap<String, RunningProcess>>>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    shutting_down: Arc<AtomicBool>,
    http: reqwest::Client,
}

impl AgentSpawner {
    pub fn new(events_tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            http: reqwest::Client::new(),
        }
    }

    /// Spawn a worker process for a claim.
    ///
    /// Records the live process in the table before awaiting any further
    /// work so that a concurrent `Terminate` can always find it.
    pub async fn spawn(&self, options: SpawnOptions) -> SpawnResult {
        if self.shutting_down.load(Ordering::SeqCst) {
            return SpawnResult {
                success: false,
                agent_id: None,
                pid: None,
                error: Some(SpawnError::ShuttingDown.to_string()),
            };
        }

        let mut command = Command::new(&options.command);
        command
            .args(&options.args)
            .current_dir(&options.workspace_path)
            .env("AGENT_ID", &options.agent_id)
            .env("CLAIM_ID", options.claim_id.to_string())
            .env("ISSUE_ID", &options.issue_id)
            .env("DASHBOARD_URL", &options.dashboard_url)
            .env("DASHBOARD_HOOK_URL", &options.dashboard_hook_url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return SpawnResult {
                    success: false,
                    agent_id: Some(options.agent_id.clone()),
                    pid: None,
                    error: Some(SpawnError::Spawn(e).to_string()),
                };
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        #[cfg(unix)]
        let pgid = pid.map(|p| p as i32).unwrap_or(0);

        let (exited_tx, exited_rx) = oneshot::channel();
        {
            let mut table = self.processes.lock().await;
            table.insert(
                options.agent_id.clone(),
                RunningProcess {
                    #[cfg(unix)]
                    pid: pgid,
                    exited_rx,
                },
            );
        }

        let spawner = self.clone();
        let agent_id = options.agent_id.clone();
        let hook_url = options.dashboard_hook_url.clone();
        let cleanup_on_success = options.cleanup_on_success;
        let workspace_path = options.workspace_path.clone();

        tokio::spawn(async move {
            spawner
                .monitor(agent_id, child, stdout, stderr, hook_url, cleanup_on_success, workspace_path, exited_tx)
                .await;
        });

        info!(agent_id = %options.agent_id, pid = ?pid, "worker process spawned");

        SpawnResult {
            success: true,
            agent_id: Some(options.agent_id),
            pid,
            error: None,
        }
    }

    async fn monitor(
        &self,
        agent_id: String,
        mut child: Child,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        hook_url: String,
        cleanup_on_success: bool,
        workspace_path: PathBuf,
        exited_tx: oneshot::Sender<()>,
    ) {
        let stdout_ring = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY_BYTES)));
        let stderr_ring = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY_BYTES)));

        let stdout_task = stdout.map(|s| {
            let ring = Arc::clone(&stdout_ring);
            let events_tx = self.events_tx.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(s).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("progress:") {
                        debug!(agent_id = %agent_id, line = %line, "worker progress line");
                    }
                    if let Some(percent) = parse_progress_percent(&line) {
                        let _ = events_tx.send(AgentEvent::Progress {
                            agent_id: agent_id.clone(),
                            percent,
                        });
                    }
                    let _ = events_tx.send(AgentEvent::Log {
                        agent_id: agent_id.clone(),
                        level: infer_log_level(&line, false),
                        line: line.clone(),
                    });
                    ring.lock().await.push(&line);
                }
            })
        });

        let stderr_task = stderr.map(|s| {
            let ring = Arc::clone(&stderr_ring);
            let events_tx = self.events_tx.clone();
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(s).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = events_tx.send(AgentEvent::Log {
                        agent_id: agent_id.clone(),
                        level: infer_log_level(&line, true),
                        line: line.clone(),
                    });
                    ring.lock().await.push(&line);
                }
            })
        });

        if let Some(t) = stdout_task {
            let _ = t.await;
        }
        if let Some(t) = stderr_task {
            let _ = t.await;
        }

        // `child` is owned by this task alone, so `wait()` never needs the
        // table lock and a concurrent `terminate` is never blocked behind it.
        let wait_result = child.wait().await;

        self.processes.lock().await.remove(&agent_id);
        let _ = exited_tx.send(());

        let event = match wait_result {
            Ok(status) if status.success() => {
                let trailing = stdout_ring.lock().await.as_string();
                if cleanup_on_success && workspace_path.join(".git").exists() {
                    let _ = tokio::fs::remove_dir_all(&workspace_path).await;
                }
                AgentEvent::Completed {
                    agent_id: agent_id.clone(),
                    trailing_stdout: trailing,
                }
            }
            Ok(status) => {
                let stderr_text = stderr_ring.lock().await.as_string();
                let error = if !stderr_text.is_empty() {
                    stderr_text
                } else {
                    let stdout_text = stdout_ring.lock().await.as_string();
                    let trimmed = trailing_bytes(&stdout_text, FAILURE_TRAILING_BYTES);
                    if !trimmed.is_empty() {
                        trimmed
                    } else {
                        format!("process exited with code {}", status.code().unwrap_or(-1))
                    }
                };
                AgentEvent::Failed {
                    agent_id: agent_id.clone(),
                    error,
                }
            }
            Err(e) => AgentEvent::Failed {
                agent_id: agent_id.clone(),
                error: e.to_string(),
            },
        };

        let _ = self.events_tx.send(event.clone());
        self.post_hook_best_effort(&hook_url, &event).await;
    }

    async fn post_hook_best_effort(&self, hook_url: &str, event: &AgentEvent) {
        if hook_url.is_empty() {
            return;
        }
        if let Err(e) = self.http.post(hook_url).json(event).send().await {
            warn!(error = %e, "best-effort lifecycle hook POST failed");
        }
    }

    /// Soft-then-hard termination of a single agent's process group.
    ///
    /// Removes the table entry up front and waits on the exit notifier
    /// `monitor` holds the real `Child` behind, rather than the table lock
    /// itself — a concurrent `monitor` is never blocked behind this call,
    /// and this call is never blocked behind `monitor`'s `wait()`.
    pub async fn terminate(&self, agent_id: &str) -> Result<(), SpawnError> {
        let (pid, mut exited_rx) = {
            let mut table = self.processes.lock().await;
            let proc = table
                .remove(agent_id)
                .ok_or_else(|| SpawnError::NotRunning(agent_id.to_string()))?;
            #[cfg(unix)]
            {
                (proc.pid, proc.exited_rx)
            }
            #[cfg(not(unix))]
            {
                (0, proc.exited_rx)
            }
        };

        #[cfg(unix)]
        unsafe {
            libc::killpg(pid, libc::SIGTERM);
        }

        let exited_in_time = tokio::select! {
            _ = &mut exited_rx => true,
            _ = tokio::time::sleep(SOFT_KILL_GRACE) => false,
        };

        if !exited_in_time {
            #[cfg(unix)]
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
            let _ = (&mut exited_rx).await;
        }

        let _ = self.events_tx.send(AgentEvent::Failed {
            agent_id: agent_id.to_string(),
            error: "terminated by orchestrator".to_string(),
        });

        Ok(())
    }

    /// Reject further spawns and terminate every live agent concurrently.
    pub async fn terminate_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let agent_ids: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        let futures = agent_ids.iter().map(|id| self.terminate(id));
        futures::future::join_all(futures).await;
    }
}

struct RingBuffer {
    capacity: usize,
    buf: std::collections::VecDeque<u8>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, line: &str) {
        for &byte in line.as_bytes() {
            if self.buf.len() >= self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(byte);
        }
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(b'\n');
    }

    fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

fn trailing_bytes(s: &str, n: usize) -> String {
    if s.len() <= n {
        s.to_string()
    } else {
        s[s.len() - n..].to_string()
    }
}

/// Parse a `[PROGRESS] <N>%` line into its percentage.
fn parse_progress_percent(line: &str) -> Option<u32> {
    let idx = line.find("[PROGRESS]")?;
    let rest = line[idx + "[PROGRESS]".len()..].trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if !rest[digits.len()..].trim_start().starts_with('%') {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_percent() {
        assert_eq!(parse_progress_percent("[PROGRESS] 42%"), Some(42));
        assert_eq!(parse_progress_percent("foo [PROGRESS] 7% bar"), Some(7));
    }

    #[test]
    fn ignores_malformed_progress_lines() {
        assert_eq!(parse_progress_percent("progress: working"), None);
        assert_eq!(parse_progress_percent("[PROGRESS] not-a-number%"), None);
        assert_eq!(parse_progress_percent("[PROGRESS] 42"), None);
    }

    #[test]
    fn ring_buffer_bounds_capacity() {
        let mut ring = RingBuffer::new(8);
        for i in 0..20 {
            ring.push(&format!("{i}"));
        }
        assert!(ring.as_string().len() <= 8);
    }

    #[test]
    fn trailing_bytes_truncates_from_the_end() {
        let s = "0123456789";
        assert_eq!(trailing_bytes(s, 4), "6789");
        assert_eq!(trailing_bytes(s, 100), "0123456789");
    }
}
