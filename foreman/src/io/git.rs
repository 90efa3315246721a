//! Git adapter for branch, rebase, and merge operations.
//!
//! The orchestrator enforces branch safety and serializes repository
//! mutations, so we keep a small, explicit wrapper around `git` subprocess
//! calls plus a process-wide registry of per-repository locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

/// Outcome of a rebase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// Rebase applied cleanly.
    Clean,
    /// Rebase hit conflicts and was aborted; the worktree is back to the
    /// pre-rebase state.
    Conflict { detail: String },
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to operate)"));
        }
        Ok(name)
    }

    /// Ensure the worktree has no staged, unstaged, or untracked changes.
    pub fn ensure_clean(&self) -> Result<()> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        if out.trim().is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        Err(anyhow!("working tree not clean:\n{}", out.trim_end()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch starting at `start_point`.
    pub fn checkout_new_branch_from(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Checkout an existing branch.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Force-delete a local branch (stale leftovers from a previous attempt).
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes. Returns Ok(false) when nothing is staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.run(&["diff", "--cached", "--name-only"])?;
        if String::from_utf8_lossy(&staged.stdout).trim().is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// True when the named remote is configured.
    pub fn has_remote(&self, name: &str) -> Result<bool> {
        let out = self.run_capture(&["remote"])?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    /// Fetch and prune from `origin`.
    pub fn fetch_prune(&self) -> Result<()> {
        self.run_checked(&["fetch", "--all", "--prune"])?;
        Ok(())
    }

    /// Push a branch to `origin`.
    pub fn push(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing branch");
        self.run_checked(&["push", "origin", branch])?;
        Ok(())
    }

    /// Rebase the current branch onto `base`.
    ///
    /// Conflicts abort the rebase and report [`RebaseOutcome::Conflict`];
    /// any other failure is a hard error.
    pub fn rebase_onto(&self, base: &str) -> Result<RebaseOutcome> {
        debug!(base, "rebasing onto base");
        let output = self.run(&["rebase", base])?;
        if output.status.success() {
            return Ok(RebaseOutcome::Clean);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = format!("{}\n{}", stdout.trim(), stderr.trim())
            .trim()
            .to_string();

        // Leave the worktree usable regardless of why the rebase stopped.
        let abort = self.run(&["rebase", "--abort"])?;
        if !abort.status.success() {
            warn!("rebase --abort failed after conflicted rebase");
        }

        if detail.contains("CONFLICT") || detail.contains("could not apply") {
            debug!(base, "rebase conflicted, aborted");
            return Ok(RebaseOutcome::Conflict { detail });
        }
        Err(anyhow!("git rebase {base} failed: {detail}"))
    }

    /// Fast-forward the current branch to `branch`.
    pub fn merge_ff_only(&self, branch: &str) -> Result<()> {
        debug!(branch, "fast-forward merging");
        self.run_checked(&["merge", "--ff-only", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Process-wide lock for one repository's branch/merge mutations.
///
/// Concurrently driven jobs share one clone; every worktree mutation
/// (branch setup, pass execution, merge) must hold this lock for its
/// repository.
pub fn repo_lock(workdir: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(workdir.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn branch_lifecycle() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());

        assert_eq!(git.current_branch().expect("branch"), "develop");
        assert!(git.branch_exists("main").expect("exists"));
        assert!(!git.branch_exists("feature/1-x").expect("exists"));

        git.checkout_new_branch_from("feature/1-x", "develop")
            .expect("new branch");
        assert_eq!(git.current_branch().expect("branch"), "feature/1-x");

        git.checkout_branch("develop").expect("checkout");
        git.delete_branch("feature/1-x").expect("delete");
        assert!(!git.branch_exists("feature/1-x").expect("exists"));
    }

    #[test]
    fn clean_rebase_then_ff_merge() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());

        git.checkout_new_branch_from("feature/1-x", "develop")
            .expect("new branch");
        fs::write(repo.root().join("feature.txt"), "change\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("add feature").expect("commit"));

        assert_eq!(git.rebase_onto("develop").expect("rebase"), RebaseOutcome::Clean);
        git.checkout_branch("develop").expect("checkout");
        git.merge_ff_only("feature/1-x").expect("merge");
        assert!(repo.root().join("feature.txt").exists());
    }

    #[test]
    fn conflicting_rebase_is_aborted_and_classified() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());

        // Branch edits the same line the base later changes.
        git.checkout_new_branch_from("feature/1-x", "develop")
            .expect("new branch");
        fs::write(repo.root().join("README.md"), "branch version\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("branch edit").expect("commit"));

        git.checkout_branch("develop").expect("checkout");
        fs::write(repo.root().join("README.md"), "develop version\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("develop edit").expect("commit"));

        git.checkout_branch("feature/1-x").expect("checkout");
        let outcome = git.rebase_onto("develop").expect("rebase");
        assert!(matches!(outcome, RebaseOutcome::Conflict { .. }));

        // Aborted: worktree is clean and still on the feature branch.
        git.ensure_clean().expect("clean after abort");
        assert_eq!(git.current_branch().expect("branch"), "feature/1-x");
    }

    #[test]
    fn repo_lock_is_shared_per_path() {
        let a = repo_lock(Path::new("/tmp/one"));
        let b = repo_lock(Path::new("/tmp/one"));
        let c = repo_lock(Path::new("/tmp/two"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
