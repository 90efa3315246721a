//! Human-facing traffic: the outbox file, notifier, and review host.
//!
//! The original deployment posts questions, progress, and pull requests to
//! external services; here that boundary is an append-only JSONL file
//! (`.foreman/outbox.jsonl`) which doubles as the audit trail. Answers and
//! approvals flow back in asynchronously as CLI events.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One line in the outbox file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pr_number: Option<u64>,
    pub text: String,
}

/// Append-only JSONL writer.
#[derive(Debug, Clone)]
pub struct Outbox {
    path: PathBuf,
}

impl Outbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &OutboxEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create outbox dir {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open outbox {}", self.path.display()))?;
        let line = serde_json::to_string(entry).context("serialize outbox entry")?;
        writeln!(file, "{line}").with_context(|| format!("append to {}", self.path.display()))?;
        debug!(kind = %entry.kind, "outbox entry appended");
        Ok(())
    }

    /// All entries currently in the outbox (empty if the file is missing).
    pub fn read_all(&self) -> Result<Vec<OutboxEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read outbox {}", self.path.display()))?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line).context("parse outbox line")?);
        }
        Ok(entries)
    }

    fn count_kind(&self, kind: &str) -> Result<usize> {
        Ok(self.read_all()?.iter().filter(|e| e.kind == kind).count())
    }
}

/// A note to surface to the humans watching the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub job_id: Option<u64>,
    pub kind: String,
    pub text: String,
}

impl Note {
    pub fn question(job_id: u64, text: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: "question".to_string(),
            text: text.into(),
        }
    }

    pub fn permission(job_id: u64, text: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: "permission_request".to_string(),
            text: text.into(),
        }
    }

    pub fn progress(job_id: u64, text: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: "progress".to_string(),
            text: text.into(),
        }
    }

    pub fn blocked(job_id: u64, text: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            kind: "blocked".to_string(),
            text: text.into(),
        }
    }
}

/// Delivery seam for notes.
pub trait Notifier {
    fn post(&self, note: &Note, now: DateTime<Utc>) -> Result<()>;
}

/// Notifier that appends to the outbox file.
pub struct OutboxNotifier {
    outbox: Outbox,
}

impl OutboxNotifier {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl Notifier for OutboxNotifier {
    fn post(&self, note: &Note, now: DateTime<Utc>) -> Result<()> {
        self.outbox.append(&OutboxEntry {
            at: now,
            kind: note.kind.clone(),
            job_id: note.job_id,
            pr_number: None,
            text: note.text.clone(),
        })
    }
}

/// Request to open a pull request for a finished coding phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    pub job_id: u64,
    pub story_id: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Pull-request surface of the review workflow.
pub trait ReviewHost {
    /// Open a pull request and return its number.
    fn open_pull_request(&self, request: &PullRequestRequest, now: DateTime<Utc>) -> Result<u64>;

    /// Ask a human to re-review after a conflicted merge.
    fn request_rereview(&self, pr_number: u64, reason: &str, now: DateTime<Utc>) -> Result<()>;
}

/// Review host that records pull requests in the outbox. Numbers are
/// sequential over the entries already recorded, so they survive restarts.
pub struct OutboxReviewHost {
    outbox: Outbox,
}

impl OutboxReviewHost {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}

impl ReviewHost for OutboxReviewHost {
    fn open_pull_request(&self, request: &PullRequestRequest, now: DateTime<Utc>) -> Result<u64> {
        let number = self.outbox.count_kind("pull_request")? as u64 + 1;
        self.outbox.append(&OutboxEntry {
            at: now,
            kind: "pull_request".to_string(),
            job_id: Some(request.job_id),
            pr_number: Some(number),
            text: format!(
                "{} ({} -> {})\n\n{}",
                request.title, request.head, request.base, request.body
            ),
        })?;
        Ok(number)
    }

    fn request_rereview(&self, pr_number: u64, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.outbox.append(&OutboxEntry {
            at: now,
            kind: "rereview_request".to_string(),
            job_id: None,
            pr_number: Some(pr_number),
            text: reason.to_string(),
        })
    }
}
