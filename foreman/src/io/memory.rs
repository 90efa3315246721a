//! Persistent project memory with budgeted compression.
//!
//! Memory carries facts across jobs (stack conventions, past decisions).
//! Compression runs between jobs, never during a pass, and is a seam: the
//! bundled [`TailCompressor`] keeps the newest content within the budget,
//! and an LLM-backed implementation can replace it without touching the
//! controller.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Approximate chars-per-token for budget estimation (conservative).
pub const CHARS_PER_TOKEN: usize = 4;

/// The memory file for one target repository.
#[derive(Debug, Clone)]
pub struct ProjectMemory {
    path: PathBuf,
}

impl ProjectMemory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load current memory. Returns an empty string when the file is missing.
    pub fn load(&self) -> Result<String> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "memory file missing, treating as empty");
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("read memory {}", self.path.display()))
    }

    pub fn save(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create memory dir {}", parent.display()))?;
        }
        fs::write(&self.path, content)
            .with_context(|| format!("write memory {}", self.path.display()))?;
        info!(path = %self.path.display(), size = content.len(), "memory saved");
        Ok(())
    }
}

/// Folds new facts into existing memory while respecting a token budget.
pub trait MemoryCompressor {
    fn compress(&self, existing: &str, new_facts: &str, budget_tokens: usize) -> Result<String>;
}

/// Budget-keeping compressor: appends the new facts, then keeps the TAIL of
/// the result (most recent entries) when the budget is exceeded.
pub struct TailCompressor;

impl MemoryCompressor for TailCompressor {
    fn compress(&self, existing: &str, new_facts: &str, budget_tokens: usize) -> Result<String> {
        let mut combined = String::new();
        if !existing.trim().is_empty() {
            combined.push_str(existing.trim_end());
            combined.push_str("\n\n");
        }
        combined.push_str(new_facts.trim());
        combined.push('\n');

        let budget_chars = budget_tokens * CHARS_PER_TOKEN;
        if combined.len() <= budget_chars {
            return Ok(combined);
        }

        // Keep the tail, starting at a line boundary past a char boundary.
        let mut start = combined.len() - budget_chars;
        while start < combined.len() && !combined.is_char_boundary(start) {
            start += 1;
        }
        let line_start = combined[start..]
            .find('\n')
            .map_or(start, |n| start + n + 1);
        debug!(
            dropped = line_start,
            budget_chars, "memory over budget, keeping tail"
        );
        Ok(format!(
            "<!-- earlier memory truncated ({line_start} chars) -->\n{}",
            &combined[line_start..]
        ))
    }
}
