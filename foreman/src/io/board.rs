//! Issue-board collaborator: ready stories in, status updates out.
//!
//! The [`Board`] trait is the seam to whatever tracks stories. The bundled
//! [`FileBoard`] keeps the board in a JSON file with atomic claim semantics,
//! which is enough for a single orchestrator per repository and for tests.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Board status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Ready,
    InProgress,
    InReview,
    Blocked,
    Done,
}

/// A story as the board sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRef {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Board position; lower means higher priority.
    pub position: u32,
    pub status: StoryStatus,
}

/// Abstraction over the issue/board source.
pub trait Board {
    /// Ready stories in priority order (position, then id).
    fn list_ready(&self) -> Result<Vec<StoryRef>>;

    /// Atomically claim a ready story. Returns false when the story is no
    /// longer ready (lost race) — callers skip to the next candidate.
    fn claim(&self, story_id: u64) -> Result<bool>;

    fn set_status(&self, story_id: u64, status: StoryStatus) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BoardFile {
    stories: Vec<StoryRef>,
}

/// JSON-file board (`.foreman/board.json`).
#[derive(Debug, Clone)]
pub struct FileBoard {
    path: PathBuf,
}

impl FileBoard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write a board file with the given stories (used by init and tests).
    pub fn write(path: &Path, stories: &[StoryRef]) -> Result<()> {
        let file = BoardFile {
            stories: stories.to_vec(),
        };
        write_board(path, &file)
    }

    fn load(&self) -> Result<BoardFile> {
        if !self.path.exists() {
            return Ok(BoardFile::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read board {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse board {}", self.path.display()))
    }
}

fn write_board(path: &Path, file: &BoardFile) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(file)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("board path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp board {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace board {}", path.display()))?;
    Ok(())
}

impl Board for FileBoard {
    fn list_ready(&self) -> Result<Vec<StoryRef>> {
        let file = self.load()?;
        let mut ready: Vec<StoryRef> = file
            .stories
            .into_iter()
            .filter(|s| s.status == StoryStatus::Ready)
            .collect();
        ready.sort_by_key(|s| (s.position, s.id));
        Ok(ready)
    }

    fn claim(&self, story_id: u64) -> Result<bool> {
        let mut file = self.load()?;
        let story = file
            .stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| anyhow!("unknown story {story_id}"))?;
        if story.status != StoryStatus::Ready {
            debug!(story = story_id, status = ?story.status, "claim lost (not ready)");
            return Ok(false);
        }
        story.status = StoryStatus::InProgress;
        write_board(&self.path, &file)?;
        debug!(story = story_id, "story claimed");
        Ok(true)
    }

    fn set_status(&self, story_id: u64, status: StoryStatus) -> Result<()> {
        let mut file = self.load()?;
        let story = file
            .stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| anyhow!("unknown story {story_id}"))?;
        story.status = status;
        write_board(&self.path, &file)
    }
}
