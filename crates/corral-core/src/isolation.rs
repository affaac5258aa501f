//! Per-claim filesystem isolation via git worktrees.
//!
//! A worktree gives each spawned agent its own working copy and branch
//! without the cost of a full clone. Git itself serializes worktree
//! mutations through a lock file on the shared object store, so every
//! mutating operation here additionally runs behind an internal async
//! mutex to avoid contending with that lock across concurrent claims.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

/// Config paths symlinked from the repo root into every worktree. None of
/// these are expected to be tracked by git, so a freshly created worktree
/// would otherwise lack them.
const SYMLINKED_CONFIG_PATHS: &[&str] = &[".env", ".envrc", ".claude", ".mcp.json", "CLAUDE.md"];

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// The filesystem location an agent should run in, and how it got there.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: Option<String>,
    /// `true` if this is the main repository rather than an isolated
    /// worktree (the isolation-failure fallback).
    pub is_main_repo: bool,
}

/// Derive the branch name for an issue. Pure function, no I/O.
///
/// Non-`[A-Za-z0-9-_]` characters in `issue_id` become `-`.
pub fn branch_name(issue_id: &str) -> String {
    let sanitized: String = issue_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("issue/{sanitized}")
}

/// Derive the worktree directory name for a branch. Pure function, no I/O.
pub fn worktree_dir_name(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Owns git-worktree lifecycle for a single repository.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    pub async fn new(repo_path: impl Into<PathBuf>) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.repo_path.join(".worktrees")
    }

    /// Run the isolation protocol for a claim's `issueId`, returning the
    /// workspace to run the agent in. Falls back to the main repository on
    /// any failure rather than propagating an error — worker dispatch must
    /// proceed even when isolation is unavailable.
    pub async fn ensure_workspace(&self, issue_id: &str) -> Workspace {
        match self.try_ensure_workspace(issue_id).await {
            Ok(ws) => ws,
            Err(err) => {
                warn!(issue_id, error = %err, "worktree isolation failed, falling back to main repo");
                Workspace {
                    path: self.repo_path.clone(),
                    branch: None,
                    is_main_repo: true,
                }
            }
        }
    }

    async fn try_ensure_workspace(&self, issue_id: &str) -> Result<Workspace, WorktreeError> {
        let _lock = self.git_lock.lock().await;

        let branch = branch_name(issue_id);
        let dir_name = worktree_dir_name(&branch);
        let path = self.worktrees_dir().join(&dir_name);

        if path.exists() {
            self.reset_worktree(&path).await?;
            self.symlink_config(&path);
            return Ok(Workspace {
                path,
                branch: Some(branch),
                is_main_repo: false,
            });
        }

        tokio::fs::create_dir_all(self.worktrees_dir())
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to create .worktrees directory".into(),
                source: e,
            })?;

        let branch_exists = self.branch_exists(&branch).await?;
        let output = if branch_exists {
            Command::new("git")
                .args(["worktree", "add"])
                .arg(&path)
                .arg(&branch)
                .current_dir(&self.repo_path)
                .output()
                .await
        } else {
            Command::new("git")
                .args(["worktree", "add", "-b"])
                .arg(&branch)
                .arg(&path)
                .current_dir(&self.repo_path)
                .output()
                .await
        }
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git worktree add".into(),
            source: e,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.symlink_config(&path);

        Ok(Workspace {
            path,
            branch: Some(branch),
            is_main_repo: false,
        })
    }

    /// Discard uncommitted changes and untracked files in an existing
    /// worktree so it can be reused for a new run of the same issue.
    async fn reset_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let reset = Command::new("git")
            .args(["reset", "--hard"])
            .current_dir(path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git reset --hard".into(),
                source: e,
            })?;
        if !reset.status.success() {
            return Err(WorktreeError::GitExit {
                command: "reset --hard".into(),
                code: reset.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&reset.stderr).to_string(),
            });
        }

        let clean = Command::new("git")
            .args(["clean", "-fd"])
            .current_dir(path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git clean -fd".into(),
                source: e,
            })?;
        if !clean.status.success() {
            return Err(WorktreeError::GitExit {
                command: "clean -fd".into(),
                code: clean.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&clean.stderr).to_string(),
            });
        }

        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse --verify".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    /// Best-effort symlinking of untracked config paths. Never overwrites
    /// an existing target; failures are logged and otherwise ignored.
    fn symlink_config(&self, worktree_path: &Path) {
        for rel in SYMLINKED_CONFIG_PATHS {
            let source = self.repo_path.join(rel);
            if !source.exists() {
                continue;
            }
            let target = worktree_path.join(rel);
            if target.exists() {
                continue;
            }
            #[cfg(unix)]
            let result = std::os::unix::fs::symlink(&source, &target);
            #[cfg(not(unix))]
            let result: std::io::Result<()> = Err(std::io::Error::other("symlinking unsupported"));

            if let Err(err) = result {
                warn!(path = %target.display(), error = %err, "failed to symlink config path into worktree");
            }
        }
    }

    /// Remove a worktree directory, idempotently.
    pub async fn remove_workspace(&self, workspace: &Workspace) -> Result<(), WorktreeError> {
        if workspace.is_main_repo {
            return Ok(());
        }
        let _lock = self.git_lock.lock().await;

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&workspace.path)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(WorktreeError::GitExit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_sanitizes_non_word_chars() {
        assert_eq!(branch_name("ORG/repo#42"), "issue/ORG-repo-42");
    }

    #[test]
    fn branch_name_preserves_safe_chars() {
        assert_eq!(branch_name("abc-123_XYZ"), "issue/abc-123_XYZ");
    }

    #[test]
    fn worktree_dir_name_sanitizes_slashes() {
        assert_eq!(worktree_dir_name("issue/abc-123"), "issue-abc-123");
    }
}
