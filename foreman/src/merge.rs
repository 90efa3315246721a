//! Merge coordinator: rebase a job's branch onto its base and classify.
//!
//! The coordinator never resolves conflicts itself and never touches the
//! protected trunk branch. Repository mutations run under the repo lock so
//! stacked feature branches cannot race each other.

use anyhow::Result;
use tracing::{info, warn};

use crate::core::job::Job;
use crate::core::types::MergeSignal;
use crate::io::config::ForemanConfig;
use crate::io::git::{Git, RebaseOutcome, repo_lock};

/// Outcome of one merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub signal: MergeSignal,
    pub detail: String,
}

/// Attempt a rebase-merge of `job.branch` into `job.base_branch`.
///
/// Clean rebase: the base is fast-forwarded to the rebased branch (and
/// pushed when a remote exists). Conflicts abort the attempt and report
/// [`MergeSignal::Conflict`]. Any other failure is [`MergeSignal::Failed`]
/// with the detail preserved for the operator.
pub fn merge(git: &Git, job: &Job, config: &ForemanConfig) -> Result<MergeReport> {
    // Merging into the trunk is a programming error, not a runtime branch:
    // jobs are only ever created with the configured base (or a stacked
    // feature branch) as their target.
    assert_ne!(
        job.base_branch, config.trunk_branch,
        "merge target must never be the protected trunk branch"
    );
    assert_ne!(
        job.branch, config.trunk_branch,
        "job branch must never be the protected trunk branch"
    );

    let lock = repo_lock(git.workdir());
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    info!(job = job.id, branch = %job.branch, base = %job.base_branch, "attempting rebase merge");

    let attempt = (|| -> Result<MergeReport> {
        git.checkout_branch(&job.branch)?;
        match git.rebase_onto(&job.base_branch)? {
            RebaseOutcome::Conflict { detail } => {
                warn!(job = job.id, "rebase conflicted, leaving for re-review");
                return Ok(MergeReport {
                    signal: MergeSignal::Conflict,
                    detail,
                });
            }
            RebaseOutcome::Clean => {}
        }

        git.checkout_branch(&job.base_branch)?;
        git.merge_ff_only(&job.branch)?;
        if git.has_remote("origin")? {
            git.push(&job.base_branch)?;
        }
        info!(job = job.id, base = %job.base_branch, "merge completed");
        Ok(MergeReport {
            signal: MergeSignal::Clean,
            detail: String::new(),
        })
    })();

    match attempt {
        Ok(report) => Ok(report),
        Err(err) => {
            warn!(job = job.id, error = %err, "merge attempt failed");
            Ok(MergeReport {
                signal: MergeSignal::Failed,
                detail: format!("{err:#}"),
            })
        }
    }
}
