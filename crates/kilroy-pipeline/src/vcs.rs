//! Narrow VCS facade over the `git` CLI.
//!
//! The engine needs exactly four capabilities: a run branch, detached
//! worktree checkouts for isolation, checkpoint commits, and SHA lookups.
//! Everything else about git stays outside this interface.

use std::path::{Path, PathBuf};

use kilroy_types::{KilroyError, Result};

pub struct GitVcs {
    repo_path: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| KilroyError::VcsError {
                operation: args.first().copied().unwrap_or("?").to_string(),
                message: format!("spawn git: {e}"),
            })?;
        if !output.status.success() {
            return Err(KilroyError::VcsError {
                operation: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// HEAD commit of the source repository.
    pub async fn head_sha(&self) -> Result<String> {
        self.git(&self.repo_path.clone(), &["rev-parse", "HEAD"]).await
    }

    /// Check out `sha` into a fresh detached worktree at `path`, creating
    /// (or resetting, on resume) `branch` there. The branch carries the
    /// run's commits; the source repository itself is never touched.
    pub async fn add_worktree(&self, path: &Path, sha: &str, branch: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Clear any stale registration from a previous run of this root.
        if path.exists() {
            let _ = self.remove_worktree(path).await;
            let _ = tokio::fs::remove_dir_all(path).await;
        }
        let _ = self.git(&self.repo_path.clone(), &["worktree", "prune"]).await;

        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_path.clone(),
            &["worktree", "add", "--detach", &path_str, sha],
        )
        .await?;
        self.git(path, &["checkout", "-B", branch]).await?;
        Ok(())
    }

    /// Remove a worktree registration (the directory itself may stay).
    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_path.clone(),
            &["worktree", "remove", "--force", &path_str],
        )
        .await
        .map(|_| ())
    }

    /// Stage everything in the worktree and commit. Empty checkpoints are
    /// allowed — a stage that changed nothing still gets its commit marker.
    /// Returns the new HEAD SHA.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<String> {
        self.git(worktree, &["add", "-A"]).await?;
        self.git(
            worktree,
            &[
                "-c",
                "user.name=kilroy",
                "-c",
                "user.email=kilroy@localhost",
                "commit",
                "--allow-empty",
                "-m",
                message,
            ],
        )
        .await?;
        self.git(worktree, &["rev-parse", "HEAD"]).await
    }

    /// HEAD of a specific worktree.
    pub async fn worktree_head(&self, worktree: &Path) -> Result<String> {
        self.git(worktree, &["rev-parse", "HEAD"]).await
    }

    /// Hard-reset a worktree to `sha` (resume restores the checkpointed
    /// state before continuing).
    pub async fn reset_hard(&self, worktree: &Path, sha: &str) -> Result<()> {
        self.git(worktree, &["reset", "--hard", sha]).await.map(|_| ())
    }
}

/// Checkpoint commit message: `attractor(<run_id>): <node_id> (<status>)`.
pub fn checkpoint_message(run_id: &str, node_id: &str, status: &str) -> String {
    format!("attractor({run_id}): {node_id} ({status})")
}

/// Branch name for a parallel branch:
/// `<prefix>/parallel/<run_id>/<branch_key>`. An empty prefix is a fatal
/// configuration error — branch names must never begin with `/parallel/`.
pub fn parallel_branch_name(prefix: &str, run_id: &str, branch_key: &str) -> Result<String> {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        return Err(KilroyError::ConfigError(
            "run branch prefix must not be empty (parallel branch names would begin with /parallel/)"
                .into(),
        ));
    }
    Ok(format!("{prefix}/parallel/{run_id}/{branch_key}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
