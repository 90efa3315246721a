//! Job controller: owns the per-job state machine and drives it between
//! suspension points.
//!
//! The controller is the only component that mutates a job's state field.
//! Everything else (pass loop, gates, merge coordinator) reports outcomes
//! as [`JobEvent`]s. Every transition is persisted before the next piece of
//! work starts, so a process restart resumes from the last committed state
//! instead of re-running completed work; suspension is expressed by
//! returning from [`Engine::drive`], never by blocking a thread.

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use std::time::Duration;

use crate::core::job::{BlockCause, Job, JobState};
use crate::core::ledger::Ledger;
use crate::core::permission::{Fingerprint, PermissionStatus};
use crate::core::question::QuestionStatus;
use crate::core::transition::{JobEvent, next_state};
use crate::core::types::{MergeSignal, PassSignal, PermissionDecision};
use crate::io::board::{Board, StoryStatus};
use crate::io::clock::TimeSource;
use crate::io::config::ForemanConfig;
use crate::io::generator::ChangeGenerator;
use crate::io::git::{Git, repo_lock};
use crate::io::init::ForemanPaths;
use crate::io::memory::{MemoryCompressor, ProjectMemory};
use crate::io::outbox::{Note, Notifier, PullRequestRequest, ReviewHost};
use crate::io::retry::with_retries;
use crate::io::store::Store;
use crate::io::test_runner::TestRunner;
use crate::merge;
use crate::pass_loop::{self, GenerationOutcome, PassDeps};
use crate::permission_gate;
use crate::question_gate::{self, ResolveOutcome};
use crate::scheduler;

/// External collaborators, one seam per interface.
pub struct Collaborators<'a> {
    pub board: &'a dyn Board,
    pub generator: &'a dyn ChangeGenerator,
    pub tests: &'a dyn TestRunner,
    pub review: &'a dyn ReviewHost,
    pub notifier: &'a dyn Notifier,
    pub compressor: &'a dyn MemoryCompressor,
    pub clock: &'a dyn TimeSource,
}

/// The orchestrator engine for one target repository.
pub struct Engine<'a> {
    pub paths: &'a ForemanPaths,
    pub config: &'a ForemanConfig,
    pub store: Store,
    pub collab: Collaborators<'a>,
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No story could be claimed.
    Nothing,
    /// A job was created and driven until it suspended or terminated.
    Drove { job_id: u64, state: JobState },
}

/// Result of delivering an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerReport {
    pub outcome: ResolveOutcome,
    pub job_id: u64,
    pub job_state: JobState,
}

impl Engine<'_> {
    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms)
    }

    /// One scheduler tick: claim the next ready story and drive its job.
    pub fn tick(&self) -> Result<TickOutcome> {
        let mut ledger = self.store.load_or_default()?;
        let Some(job_id) =
            scheduler::claim_next(&mut ledger, self.collab.board, self.config, self.collab.clock)?
        else {
            return Ok(TickOutcome::Nothing);
        };
        self.store.save(&ledger)?;

        let state = self.drive(&mut ledger, job_id)?;
        Ok(TickOutcome::Drove { job_id, state })
    }

    /// Re-drive a job (after a restart, or just to re-check gate deadlines).
    pub fn resume(&self, job_id: u64) -> Result<JobState> {
        let mut ledger = self.store.load()?;
        if ledger.job(job_id).is_none() {
            return Err(anyhow!("unknown job {job_id}"));
        }
        self.drive(&mut ledger, job_id)
    }

    /// Deliver a human answer to a pending question.
    pub fn answer(&self, question_id: u64, text: &str) -> Result<AnswerReport> {
        let mut ledger = self.store.load()?;
        let now = self.collab.clock.now();
        let outcome = question_gate::resolve(&mut ledger, question_id, text, now)?;
        let job_id = ledger
            .question(question_id)
            .map(|q| q.job_id)
            .ok_or_else(|| anyhow!("unknown question {question_id}"))?;
        self.store.save(&ledger)?;

        let job_state = ledger
            .job(job_id)
            .map(|j| j.state)
            .ok_or_else(|| anyhow!("question {question_id} references unknown job {job_id}"))?;

        let job_state = match (&outcome, job_state) {
            (ResolveOutcome::Answered, JobState::AwaitingAnswer) => {
                self.apply(&mut ledger, job_id, JobEvent::QuestionAnswered)?;
                self.drive(&mut ledger, job_id)?
            }
            (ResolveOutcome::Expired, JobState::AwaitingAnswer) => {
                self.block(
                    &mut ledger,
                    job_id,
                    JobEvent::QuestionExpired,
                    BlockCause::QuestionExpired { question_id },
                )?;
                JobState::Blocked
            }
            _ => job_state,
        };

        Ok(AnswerReport {
            outcome,
            job_id,
            job_state,
        })
    }

    /// Record a human permission decision and resume any jobs suspended on
    /// that fingerprint.
    pub fn resolve_permission(
        &self,
        fingerprint: &Fingerprint,
        decision: PermissionDecision,
    ) -> Result<Vec<(u64, JobState)>> {
        let mut ledger = self.store.load()?;
        permission_gate::resolve(&mut ledger, fingerprint, decision)?;
        self.store.save(&ledger)?;

        let waiting: Vec<u64> = ledger
            .jobs
            .iter()
            .filter(|j| {
                j.state == JobState::AwaitingPermission
                    && j.pending_fingerprint.as_ref() == Some(fingerprint)
            })
            .map(|j| j.id)
            .collect();

        let mut results = Vec::new();
        for job_id in waiting {
            let state = self.drive(&mut ledger, job_id)?;
            results.push((job_id, state));
        }
        Ok(results)
    }

    /// Human re-approval after a conflicted merge: re-attempt the merge.
    pub fn approve_review(&self, job_id: u64) -> Result<JobState> {
        let mut ledger = self.store.load()?;
        let state = ledger
            .job(job_id)
            .map(|j| j.state)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        if state != JobState::NeedsReReview {
            return Err(anyhow!(
                "job {job_id} is '{}', re-approval only applies to 'needs_re_review'",
                state.as_str()
            ));
        }
        self.apply(&mut ledger, job_id, JobEvent::ReviewApproved)?;
        self.drive(&mut ledger, job_id)
    }

    /// Expire stale questions and block their jobs. Idempotent.
    pub fn sweep(&self) -> Result<Vec<(u64, u64)>> {
        let mut ledger = self.store.load_or_default()?;
        let now = self.collab.clock.now();
        let expired = question_gate::sweep(&mut ledger, now);
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        self.store.save(&ledger)?;

        let mut blocked = Vec::new();
        for question_id in expired {
            let job_id = ledger
                .question(question_id)
                .map(|q| q.job_id)
                .ok_or_else(|| anyhow!("expired question {question_id} has no job"))?;
            if ledger.job(job_id).map(|j| j.state) == Some(JobState::AwaitingAnswer) {
                self.block(
                    &mut ledger,
                    job_id,
                    JobEvent::QuestionExpired,
                    BlockCause::QuestionExpired { question_id },
                )?;
                blocked.push((job_id, question_id));
            }
        }
        Ok(blocked)
    }

    /// Request cancellation; honored at the next suspension-point boundary.
    ///
    /// A suspended job blocks immediately. A terminal job is left untouched.
    pub fn cancel(&self, job_id: u64) -> Result<JobState> {
        let mut ledger = self.store.load()?;
        let job = ledger
            .job_mut(job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        if job.state.is_terminal() {
            debug!(job = job_id, state = job.state.as_str(), "cancel ignored: job is terminal");
            return Ok(job.state);
        }
        job.cancel_requested = true;
        self.store.save(&ledger)?;
        self.drive(&mut ledger, job_id)
    }

    /// Drive a job until it suspends or terminates.
    pub fn drive(&self, ledger: &mut Ledger, job_id: u64) -> Result<JobState> {
        loop {
            let job = ledger
                .job(job_id)
                .ok_or_else(|| anyhow!("unknown job {job_id}"))?
                .clone();

            if job.state.is_terminal() {
                return Ok(job.state);
            }
            if job.cancel_requested {
                info!(job = job_id, "cancellation honored at suspension boundary");
                // Discard pending waits: the question expires with the job;
                // the permission record is shared and stays for other jobs.
                if let Some(question_id) = ledger.pending_question_for_job(job_id).map(|q| q.id) {
                    ledger
                        .question_mut(question_id)
                        .expect("question exists")
                        .status = QuestionStatus::Expired;
                }
                ledger
                    .job_mut(job_id)
                    .expect("job exists")
                    .pending_fingerprint = None;
                self.block(ledger, job_id, JobEvent::Cancelled, BlockCause::Cancelled)?;
                continue;
            }

            match job.state {
                JobState::Claimed => {
                    if let Err(err) = self.setup_branch(&job) {
                        self.collaborator_failure(ledger, job_id, &err)?;
                        continue;
                    }
                    self.apply(ledger, job_id, JobEvent::Started)?;
                }

                JobState::Generating => {
                    // The whole pass (generation + tests) holds the repo lock:
                    // concurrent jobs share one clone and must not interleave
                    // worktree mutations.
                    let lock = repo_lock(&self.paths.root);
                    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                    let git = Git::new(&self.paths.root);
                    if let Err(err) = prepare_worktree(&git, &job) {
                        self.collaborator_failure(ledger, job_id, &err)?;
                        continue;
                    }

                    let deps = PassDeps {
                        generator: self.collab.generator,
                        clock: self.collab.clock,
                    };
                    match pass_loop::generate_change(&job, ledger, self.paths, self.config, &deps) {
                        Ok(GenerationOutcome::NeedsAnswer { prompt }) => {
                            question_gate::ask(
                                ledger,
                                job_id,
                                &prompt,
                                chrono::Duration::minutes(
                                    self.config.question_timeout_minutes as i64,
                                ),
                                self.collab.notifier,
                                self.collab.clock.now(),
                            )?;
                            self.apply(
                                ledger,
                                job_id,
                                JobEvent::PassResult(PassSignal::BlockedQuestion),
                            )?;
                        }
                        Ok(GenerationOutcome::NeedsPermission { fingerprint }) => {
                            ledger
                                .job_mut(job_id)
                                .expect("job exists")
                                .pending_fingerprint = Some(fingerprint.clone());
                            self.apply(
                                ledger,
                                job_id,
                                JobEvent::PassResult(PassSignal::BlockedPermission),
                            )?;
                            if let Some(record) = ledger.permission(&fingerprint)
                                && record.status == PermissionStatus::Pending
                            {
                                let note = Note::permission(
                                    job_id,
                                    format!(
                                        "approval needed for `{}` ({}): {}",
                                        record.artifact_path, fingerprint, record.description
                                    ),
                                );
                                self.post_note(&note);
                            }
                            // The AwaitingPermission arm settles pending/denied.
                        }
                        Ok(GenerationOutcome::ChangeReady { summary, .. }) => {
                            self.apply(ledger, job_id, JobEvent::TestsStarted)?;
                            self.post_note(&Note::progress(job_id, summary));
                            if let Err(err) = self.finish_pass(ledger, job_id, &git) {
                                self.collaborator_failure(ledger, job_id, &err)?;
                            }
                        }
                        Err(err) => {
                            self.collaborator_failure(ledger, job_id, &err)?;
                        }
                    }
                }

                JobState::TestingPass => {
                    // Reached on resume after a crash mid-pass: the change is
                    // already in the worktree, only the verdict is missing.
                    let lock = repo_lock(&self.paths.root);
                    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                    let git = Git::new(&self.paths.root);
                    if let Err(err) = prepare_worktree(&git, &job)
                        .and_then(|()| self.finish_pass(ledger, job_id, &git))
                    {
                        self.collaborator_failure(ledger, job_id, &err)?;
                    }
                }

                JobState::AwaitingAnswer => {
                    // Deadlines are re-checked on every resume, not merely
                    // scheduled: a restarted process still expires stale
                    // waits, and a crash between a gate update and the job
                    // transition is healed by re-deriving the event from the
                    // question record.
                    let now = self.collab.clock.now();
                    let latest = ledger
                        .questions
                        .iter()
                        .filter(|q| q.job_id == job_id)
                        .max_by_key(|q| q.id)
                        .cloned()
                        .ok_or_else(|| {
                            anyhow!("job {job_id} awaiting an answer without a question")
                        })?;
                    if latest.is_expired_at(now) {
                        ledger
                            .question_mut(latest.id)
                            .expect("question exists")
                            .status = QuestionStatus::Expired;
                    }
                    match ledger.question(latest.id).expect("question exists").status {
                        QuestionStatus::Expired => {
                            self.block(
                                ledger,
                                job_id,
                                JobEvent::QuestionExpired,
                                BlockCause::QuestionExpired {
                                    question_id: latest.id,
                                },
                            )?;
                        }
                        QuestionStatus::Answered => {
                            self.apply(ledger, job_id, JobEvent::QuestionAnswered)?;
                        }
                        QuestionStatus::Pending => return Ok(JobState::AwaitingAnswer),
                    }
                }

                JobState::AwaitingPermission => {
                    let fingerprint = job.pending_fingerprint.clone().ok_or_else(|| {
                        anyhow!("job {job_id} awaiting permission without a fingerprint")
                    })?;
                    let status = ledger
                        .permission(&fingerprint)
                        .map(|r| r.status)
                        .ok_or_else(|| anyhow!("no permission record for {fingerprint}"))?;
                    match status {
                        PermissionStatus::Approved => {
                            ledger
                                .job_mut(job_id)
                                .expect("job exists")
                                .pending_fingerprint = None;
                            // Re-attempts the same pass; the count is untouched.
                            self.apply(
                                ledger,
                                job_id,
                                JobEvent::PermissionResolved(PermissionDecision::Approved),
                            )?;
                        }
                        PermissionStatus::Denied => {
                            self.block(
                                ledger,
                                job_id,
                                JobEvent::PermissionResolved(PermissionDecision::Denied),
                                BlockCause::PermissionDenied { fingerprint },
                            )?;
                        }
                        PermissionStatus::Pending => return Ok(JobState::AwaitingPermission),
                    }
                }

                JobState::ReadyForReview => {
                    if let Err(err) = self.open_pull_request_once(ledger, job_id) {
                        self.collaborator_failure(ledger, job_id, &err)?;
                        continue;
                    }
                    self.apply(ledger, job_id, JobEvent::MergeStarted)?;
                }

                JobState::Merging => {
                    let git = Git::new(&self.paths.root);
                    let report = merge::merge(&git, &job, self.config)?;
                    match report.signal {
                        MergeSignal::Clean => {
                            self.apply(ledger, job_id, JobEvent::MergeResult(MergeSignal::Clean))?;
                            if let Err(err) = self.set_board_status(job.story_id, StoryStatus::Done)
                            {
                                warn!(job = job_id, error = %err, "board update failed after merge");
                            }
                            self.post_note(&Note::progress(
                                job_id,
                                format!("merged `{}` into `{}`", job.branch, job.base_branch),
                            ));
                        }
                        MergeSignal::Conflict => {
                            self.apply(
                                ledger,
                                job_id,
                                JobEvent::MergeResult(MergeSignal::Conflict),
                            )?;
                            if let Some(pr_number) = job.pr_number {
                                let now = self.collab.clock.now();
                                let result = with_retries(
                                    "review.request_rereview",
                                    self.config.retry_attempts,
                                    self.retry_delay(),
                                    || {
                                        self.collab.review.request_rereview(
                                            pr_number,
                                            "rebase conflicts need resolution",
                                            now,
                                        )
                                    },
                                );
                                if let Err(err) = result {
                                    warn!(job = job_id, error = %err, "re-review request failed");
                                }
                            }
                        }
                        MergeSignal::Failed => {
                            self.block(
                                ledger,
                                job_id,
                                JobEvent::MergeResult(MergeSignal::Failed),
                                BlockCause::MergeFailed {
                                    detail: report.detail,
                                },
                            )?;
                        }
                    }
                }

                JobState::NeedsReReview => return Ok(JobState::NeedsReReview),

                // Terminal states returned at the top of the loop.
                JobState::Merged | JobState::Blocked => unreachable!("terminal states return early"),
            }
        }
    }

    /// Apply one event: transition, stamp, persist.
    fn apply(&self, ledger: &mut Ledger, job_id: u64, event: JobEvent) -> Result<JobState> {
        let now = self.collab.clock.now();
        let job = ledger
            .job_mut(job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        let next = next_state(job.state, &event)?;
        info!(
            job = job_id,
            from = job.state.as_str(),
            to = next.as_str(),
            event = ?event,
            "transition"
        );
        job.state = next;
        job.updated_at = now;
        self.store.save(ledger)?;
        Ok(next)
    }

    /// Apply a blocking event, record its cause, and reflect it outward.
    fn block(
        &self,
        ledger: &mut Ledger,
        job_id: u64,
        event: JobEvent,
        cause: BlockCause,
    ) -> Result<()> {
        let state = self.apply(ledger, job_id, event)?;
        if state != JobState::Blocked {
            return Err(anyhow!(
                "expected a blocking transition, reached '{}'",
                state.as_str()
            ));
        }
        let job = ledger.job_mut(job_id).expect("job exists");
        job.block_cause = Some(cause.clone());
        let story_id = job.story_id;
        self.store.save(ledger)?;
        warn!(job = job_id, cause = %cause, "job blocked");

        if let Err(err) = self.set_board_status(story_id, StoryStatus::Blocked) {
            warn!(job = job_id, error = %err, "board update failed for blocked job");
        }
        self.post_note(&Note::blocked(job_id, cause.to_string()));
        Ok(())
    }

    /// Escalate an exhausted collaborator failure to a blocked job, with the
    /// originating cause preserved for operator visibility.
    fn collaborator_failure(
        &self,
        ledger: &mut Ledger,
        job_id: u64,
        err: &anyhow::Error,
    ) -> Result<()> {
        self.block(
            ledger,
            job_id,
            JobEvent::CollaboratorFailed,
            BlockCause::CollaboratorFailure {
                detail: format!("{err:#}"),
            },
        )
    }

    /// Create the job's working branch from its base.
    fn setup_branch(&self, job: &Job) -> Result<()> {
        let lock = repo_lock(&self.paths.root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let git = Git::new(&self.paths.root);

        // Refuse to clobber operator work left in the tree.
        git.ensure_clean()?;

        let start_point = if git.has_remote("origin")? {
            git.fetch_prune()?;
            format!("origin/{}", job.base_branch)
        } else {
            job.base_branch.clone()
        };

        if git.branch_exists(&job.branch)? {
            // Stale leftover from an earlier attempt at this story.
            if git.current_branch()? == job.branch {
                git.checkout_branch(&job.base_branch)?;
            }
            git.delete_branch(&job.branch)?;
        }
        git.checkout_new_branch_from(&job.branch, &start_point)
            .with_context(|| format!("create branch {} from {start_point}", job.branch))?;
        info!(job = job.id, branch = %job.branch, base = %start_point, "branch created");
        Ok(())
    }

    /// Test phase of the current pass: verdict, durable outcome, commit.
    ///
    /// Assumes the repo lock is held and the worktree is on the job branch.
    fn finish_pass(&self, ledger: &mut Ledger, job_id: u64, git: &Git) -> Result<()> {
        let job = ledger.job(job_id).expect("job exists").clone();
        let verdict = pass_loop::run_tests(&job, self.paths, self.config, self.collab.tests)?;
        let pass_number = job.passes_used + 1;

        {
            let job = ledger.job_mut(job_id).expect("job exists");
            job.passes_used = pass_number;
            job.last_failure = if verdict.passed {
                None
            } else {
                Some(verdict.failure_summary.clone())
            };
        }
        let signal = if verdict.passed {
            PassSignal::Passed
        } else {
            PassSignal::Failed
        };
        // The outcome is durably recorded here, before anything of pass N+1.
        self.apply(ledger, job_id, JobEvent::PassResult(signal))?;

        // Commit the pass so the worktree is clean at every suspension point.
        git.add_all()?;
        let committed = git.commit_staged(&format!(
            "chore(job-{job_id}): pass {pass_number} {}",
            if verdict.passed { "passed" } else { "failed" }
        ))?;
        debug!(job = job_id, pass = pass_number, committed, "pass committed");

        self.post_note(&Note::progress(
            job_id,
            format!(
                "pass {pass_number}/{} {}",
                self.config.max_passes,
                if verdict.passed { "passed" } else { "failed" }
            ),
        ));

        if !verdict.passed && pass_number >= self.config.max_passes {
            self.block(
                ledger,
                job_id,
                JobEvent::MaxPassesExceeded,
                BlockCause::MaxPassesExceeded {
                    passes: pass_number,
                    last_failure: Some(verdict.failure_summary),
                },
            )?;
        }
        Ok(())
    }

    /// Push the branch, open the pull request, reflect the board, and fold
    /// the run's facts into project memory. Idempotent via `pr_number`.
    fn open_pull_request_once(&self, ledger: &mut Ledger, job_id: u64) -> Result<()> {
        let job = ledger.job(job_id).expect("job exists").clone();
        if job.pr_number.is_some() {
            return Ok(());
        }

        let git = Git::new(&self.paths.root);
        if git.has_remote("origin")? {
            assert_ne!(
                job.branch, self.config.trunk_branch,
                "never push the protected trunk branch"
            );
            with_retries(
                "git.push",
                self.config.retry_attempts,
                self.retry_delay(),
                || git.push(&job.branch),
            )?;
        }

        let request = PullRequestRequest {
            job_id,
            story_id: job.story_id,
            title: format!("feat(#{}): {}", job.story_id, job.story_title),
            body: format!(
                "{}\n\nPasses used: {}\n\nCloses #{}",
                job.story_body, job.passes_used, job.story_id
            ),
            head: job.branch.clone(),
            base: job.base_branch.clone(),
        };
        let now = self.collab.clock.now();
        let pr_number = with_retries(
            "review.open_pull_request",
            self.config.retry_attempts,
            self.retry_delay(),
            || self.collab.review.open_pull_request(&request, now),
        )?;
        ledger.job_mut(job_id).expect("job exists").pr_number = Some(pr_number);
        self.store.save(ledger)?;
        info!(job = job_id, pr = pr_number, "pull request opened");

        self.set_board_status(job.story_id, StoryStatus::InReview)?;
        self.post_note(&Note::progress(job_id, format!("opened PR #{pr_number}")));

        self.fold_memory(ledger.job(job_id).expect("job exists"));
        Ok(())
    }

    /// Fold the finished coding phase's facts into project memory. Memory is
    /// advisory, so failures only warn.
    fn fold_memory(&self, job: &Job) {
        let memory = ProjectMemory::new(&self.paths.memory_path);
        let result = memory.load().and_then(|existing| {
            let facts = format!(
                "Completed story #{}: {}\nBranch: {}, PR: #{}\nPasses: {}",
                job.story_id,
                job.story_title,
                job.branch,
                job.pr_number.unwrap_or(0),
                job.passes_used
            );
            let updated = self.collab.compressor.compress(
                &existing,
                &facts,
                self.config.memory_budget_tokens,
            )?;
            memory.save(&updated)
        });
        if let Err(err) = result {
            warn!(job = job.id, error = %err, "memory update failed");
        }
    }

    fn set_board_status(&self, story_id: u64, status: StoryStatus) -> Result<()> {
        with_retries(
            "board.set_status",
            self.config.retry_attempts,
            self.retry_delay(),
            || self.collab.board.set_status(story_id, status),
        )
    }

    /// Notes are operator convenience; delivery failure only warns.
    fn post_note(&self, note: &Note) {
        if let Err(err) = self.collab.notifier.post(note, self.collab.clock.now()) {
            warn!(kind = %note.kind, error = %err, "note delivery failed");
        }
    }
}

/// Put the worktree on the job's branch, refusing to clobber another job's
/// uncommitted state.
fn prepare_worktree(git: &Git, job: &Job) -> Result<()> {
    let current = git.current_branch()?;
    if current == job.branch {
        return Ok(());
    }
    git.ensure_clean()
        .context("worktree has changes from another job")?;
    git.checkout_branch(&job.branch)
}
