//! Test-only helpers: scripted collaborators, fixture builders, and a real
//! git repository with trunk and integration branches.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::job::{Job, JobState};
use crate::core::question::{Question, QuestionStatus};
use crate::core::types::TestVerdict;
use crate::io::board::{StoryRef, StoryStatus};
use crate::io::clock::TimeSource;
use crate::io::generator::{ChangeGenerator, PassRequest, Proposal};
use crate::io::outbox::{Note, Notifier, PullRequestRequest, ReviewHost};
use crate::io::test_runner::{TestRequest, TestRunner};

/// A fixed reference instant for deterministic deadline tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

/// Create a deterministic job in the given state.
pub fn job_in_state(id: u64, story_id: u64, state: JobState) -> Job {
    Job {
        id,
        story_id,
        story_title: format!("story {story_id} title"),
        story_body: format!("story {story_id} body"),
        story_labels: Vec::new(),
        state,
        passes_used: 0,
        branch: format!("feature/{story_id}-story-{story_id}-title"),
        base_branch: "develop".to_string(),
        pr_number: None,
        last_failure: None,
        pending_fingerprint: None,
        block_cause: None,
        cancel_requested: false,
        created_at: t0(),
        updated_at: t0(),
    }
}

/// Create a pending question owned by a job.
pub fn pending_question(id: u64, job_id: u64, prompt: &str) -> Question {
    Question {
        id,
        job_id,
        prompt: prompt.to_string(),
        status: QuestionStatus::Pending,
        answer: None,
        asked_at: t0(),
        deadline: t0() + chrono::Duration::minutes(30),
    }
}

/// Create a ready story with deterministic defaults.
pub fn story(id: u64, title: &str, position: u32) -> StoryRef {
    StoryRef {
        id,
        title: title.to_string(),
        body: format!("{title} body"),
        labels: Vec::new(),
        position,
        status: StoryStatus::Ready,
    }
}

/// Settable clock for deterministic deadline logic.
pub struct FixedClock {
    now: Cell<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl TimeSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Generator returning scripted proposals, recording each request's context.
pub struct ScriptedGenerator {
    proposals: RefCell<VecDeque<Proposal>>,
    pub contexts: RefCell<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn with_proposals(proposals: Vec<Proposal>) -> Self {
        Self {
            proposals: RefCell::new(proposals.into()),
            contexts: RefCell::new(Vec::new()),
        }
    }
}

impl ChangeGenerator for ScriptedGenerator {
    fn propose(&self, request: &PassRequest) -> Result<Proposal> {
        self.contexts.borrow_mut().push(request.context.clone());
        self.proposals
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator exhausted"))
    }
}

/// Test runner returning scripted verdicts.
pub struct ScriptedTestRunner {
    verdicts: RefCell<VecDeque<TestVerdict>>,
}

impl ScriptedTestRunner {
    pub fn with_verdicts(verdicts: Vec<TestVerdict>) -> Self {
        Self {
            verdicts: RefCell::new(verdicts.into()),
        }
    }

    pub fn passing() -> TestVerdict {
        TestVerdict {
            passed: true,
            failure_summary: String::new(),
        }
    }

    pub fn failing(summary: &str) -> TestVerdict {
        TestVerdict {
            passed: false,
            failure_summary: summary.to_string(),
        }
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _request: &TestRequest) -> Result<TestVerdict> {
        self.verdicts
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted test runner exhausted"))
    }
}

/// Notifier recording every note.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notes: RefCell<Vec<Note>>,
}

impl Notifier for RecordingNotifier {
    fn post(&self, note: &Note, _now: DateTime<Utc>) -> Result<()> {
        self.notes.borrow_mut().push(note.clone());
        Ok(())
    }
}

/// Review host recording pull requests and re-review requests.
#[derive(Default)]
pub struct RecordingReviewHost {
    pub opened: RefCell<Vec<PullRequestRequest>>,
    pub rereviews: RefCell<Vec<(u64, String)>>,
}

impl ReviewHost for RecordingReviewHost {
    fn open_pull_request(&self, request: &PullRequestRequest, _now: DateTime<Utc>) -> Result<u64> {
        let mut opened = self.opened.borrow_mut();
        opened.push(request.clone());
        Ok(opened.len() as u64)
    }

    fn request_rereview(&self, pr_number: u64, reason: &str, _now: DateTime<Utc>) -> Result<()> {
        self.rereviews
            .borrow_mut()
            .push((pr_number, reason.to_string()));
        Ok(())
    }
}

/// A real git repository with `main` (trunk) and `develop` (integration)
/// branches, an initial commit, and a configured identity. The worktree is
/// left on `develop`.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().to_path_buf();

        run_git(&root, &["init"])?;
        run_git(&root, &["config", "user.email", "test@example.com"])?;
        run_git(&root, &["config", "user.name", "test"])?;

        std::fs::write(root.join("README.md"), "hi\n")?;
        run_git(&root, &["add", "README.md"])?;
        run_git(&root, &["commit", "-m", "chore: init"])?;
        run_git(&root, &["branch", "-M", "main"])?;
        run_git(&root, &["checkout", "-b", "develop"])?;

        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .map_err(|e| anyhow!("spawn git {args:?}: {e}"))?;
    if !status.status.success() {
        return Err(anyhow!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        ));
    }
    Ok(())
}
