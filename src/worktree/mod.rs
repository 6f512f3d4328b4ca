//! Thin interface over the external git-worktree helper. Sessions that
//! request filesystem isolation get a dedicated checkout per session.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Information about a verified repository.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    /// The repository's default branch.
    pub default_branch: String,
}

/// An existing or newly created worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Path of the worktree.
    pub worktree_path: PathBuf,
}

/// Request for an isolated worktree.
#[derive(Debug, Clone)]
pub struct WorktreeRequest {
    /// Repository root the worktree is carved from.
    pub repo_root: PathBuf,
    /// Branch to create or reuse.
    pub branch: String,
    /// Directory new worktrees are created under.
    pub base_dir: PathBuf,
}

/// Broker for per-session isolated checkouts.
#[async_trait]
pub trait WorktreeBroker: Send + Sync {
    /// Verify a repository is present and usable.
    async fn ensure_repo_ready(&self, repo_root: &Path) -> anyhow::Result<RepoInfo>;

    /// Idempotently provision a worktree: an existing worktree for the
    /// branch is returned as-is, otherwise one is created.
    async fn ensure_worktree(&self, request: &WorktreeRequest) -> anyhow::Result<WorktreeInfo>;

    /// List worktrees of a repository.
    async fn list(&self, repo_root: &Path) -> anyhow::Result<Vec<WorktreeInfo>>;

    /// Remove the worktree for a branch. Missing worktrees are not an error.
    async fn remove(&self, repo_root: &Path, branch: &str) -> anyhow::Result<()>;

    /// Whether this broker is the deterministic stub (no helper available).
    /// The session manager rejects workspace-backed creation when it is.
    fn is_stub(&self) -> bool {
        false
    }
}

/// Broker that shells out to the `git` binary.
#[derive(Debug, Default)]
pub struct GitWorktreeBroker;

impl GitWorktreeBroker {
    /// Create a new git broker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Probe whether the git helper is available on this host.
    pub async fn available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl WorktreeBroker for GitWorktreeBroker {
    async fn ensure_repo_ready(&self, repo_root: &Path) -> anyhow::Result<RepoInfo> {
        let output = Command::new("git")
            .current_dir(repo_root)
            .args(["symbolic-ref", "--short", "HEAD"])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "not a usable git repository at {}: {stderr}",
                repo_root.display()
            );
        }

        let default_branch = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(RepoInfo { default_branch })
    }

    async fn ensure_worktree(&self, request: &WorktreeRequest) -> anyhow::Result<WorktreeInfo> {
        // Idempotency: reuse an existing worktree for the branch.
        for existing in self.list(&request.repo_root).await? {
            if existing.branch == request.branch {
                tracing::debug!(
                    branch = %request.branch,
                    worktree = %existing.worktree_path.display(),
                    "reusing existing worktree"
                );
                return Ok(existing);
            }
        }

        let worktree_path = request.base_dir.join(&request.branch);
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new("git")
            .current_dir(&request.repo_root)
            .args(["worktree", "add", "-b", &request.branch])
            .arg(&worktree_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                repo = %request.repo_root.display(),
                branch = %request.branch,
                stderr = %stderr,
                "failed to create git worktree"
            );
            anyhow::bail!("failed to create worktree: {stderr}");
        }

        tracing::info!(
            worktree = %worktree_path.display(),
            branch = %request.branch,
            "created git worktree"
        );

        Ok(WorktreeInfo {
            branch: request.branch.clone(),
            worktree_path,
        })
    }

    async fn list(&self, repo_root: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
        let output = Command::new("git")
            .current_dir(repo_root)
            .args(["worktree", "list", "--porcelain"])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to list worktrees: {stderr}");
        }

        Ok(parse_worktree_list(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn remove(&self, repo_root: &Path, branch: &str) -> anyhow::Result<()> {
        let Some(worktree) = self
            .list(repo_root)
            .await?
            .into_iter()
            .find(|w| w.branch == branch)
        else {
            return Ok(());
        };

        let output = Command::new("git")
            .current_dir(repo_root)
            .args(["worktree", "remove", "--force"])
            .arg(&worktree.worktree_path)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The worktree might already be gone; clean up the directory.
            tracing::warn!("failed to remove worktree via git: {stderr}");
            if worktree.worktree_path.exists() {
                tokio::fs::remove_dir_all(&worktree.worktree_path).await?;
            }
        }

        tracing::info!(
            worktree = %worktree.worktree_path.display(),
            "removed git worktree"
        );
        Ok(())
    }
}

/// Parse `git worktree list --porcelain` output. The main checkout (no
/// dedicated branch entry or detached HEAD) is included with its branch when
/// reported.
fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(path));
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            if let Some(path) = current_path.take() {
                let branch = branch_ref
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch_ref)
                    .to_owned();
                worktrees.push(WorktreeInfo {
                    branch,
                    worktree_path: path,
                });
            }
        } else if line.is_empty() {
            current_path = None;
        }
    }

    worktrees
}

/// Deterministic stand-in when no git helper is available: list is empty,
/// remove is a no-op, ensure is an error.
#[derive(Debug, Default)]
pub struct StubWorktreeBroker;

impl StubWorktreeBroker {
    /// Create a new stub broker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorktreeBroker for StubWorktreeBroker {
    async fn ensure_repo_ready(&self, repo_root: &Path) -> anyhow::Result<RepoInfo> {
        anyhow::bail!(
            "no worktree helper available; cannot verify repository at {}",
            repo_root.display()
        )
    }

    async fn ensure_worktree(&self, _request: &WorktreeRequest) -> anyhow::Result<WorktreeInfo> {
        anyhow::bail!("no worktree helper available")
    }

    async fn list(&self, _repo_root: &Path) -> anyhow::Result<Vec<WorktreeInfo>> {
        Ok(Vec::new())
    }

    async fn remove(&self, _repo_root: &Path, _branch: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_stub(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worktree_list_porcelain() {
        let output = "\
worktree /repos/main
HEAD 0123456789abcdef0123456789abcdef01234567
branch refs/heads/main

worktree /worktrees/session-ab12cd34
HEAD fedcba9876543210fedcba9876543210fedcba98
branch refs/heads/session/ab12cd34
";
        let worktrees = parse_worktree_list(output);
        assert_eq!(worktrees.len(), 2);
        assert_eq!(worktrees[0].branch, "main");
        assert_eq!(worktrees[1].branch, "session/ab12cd34");
        assert_eq!(
            worktrees[1].worktree_path,
            PathBuf::from("/worktrees/session-ab12cd34")
        );
    }

    #[test]
    fn test_parse_worktree_list_skips_detached() {
        let output = "\
worktree /repos/main
HEAD 0123456789abcdef0123456789abcdef01234567
detached
";
        assert!(parse_worktree_list(output).is_empty());
    }

    #[tokio::test]
    async fn test_stub_is_deterministic() {
        let stub = StubWorktreeBroker::new();
        assert!(stub.is_stub());
        assert!(stub.list(Path::new("/nowhere")).await.unwrap().is_empty());
        stub.remove(Path::new("/nowhere"), "branch").await.unwrap();
        assert!(
            stub.ensure_worktree(&WorktreeRequest {
                repo_root: PathBuf::from("/nowhere"),
                branch: "b".to_owned(),
                base_dir: PathBuf::from("/tmp"),
            })
            .await
            .is_err()
        );
    }
}
