//! Durable ledger storage (`.foreman/state/state.json`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::ledger::Ledger;

/// Atomic load/save for the ledger (temp file + rename).
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger from disk.
    pub fn load(&self) -> Result<Ledger> {
        debug!(path = %self.path.display(), "loading ledger");
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;
        let ledger: Ledger = serde_json::from_str(&contents)
            .with_context(|| format!("parse ledger {}", self.path.display()))?;
        debug!(jobs = ledger.jobs.len(), "ledger loaded");
        Ok(ledger)
    }

    /// Load the ledger, or an empty one if the file does not exist yet.
    pub fn load_or_default(&self) -> Result<Ledger> {
        if !self.path.exists() {
            return Ok(Ledger::default());
        }
        self.load()
    }

    /// Atomically write the ledger to disk. One rename commits one
    /// controller transition.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        debug!(path = %self.path.display(), jobs = ledger.jobs.len(), "writing ledger");
        let mut buf = serde_json::to_string_pretty(ledger)?;
        buf.push('\n');

        let parent = self
            .path
            .parent()
            .with_context(|| format!("ledger path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace ledger {}", self.path.display()))?;
        Ok(())
    }
}
