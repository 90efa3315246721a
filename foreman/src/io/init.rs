//! Initialization helpers for `.foreman/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::ledger::Ledger;
use crate::io::board::FileBoard;
use crate::io::config::{ForemanConfig, write_config};
use crate::io::store::Store;

/// All canonical paths within `.foreman/` for a project root.
#[derive(Debug, Clone)]
pub struct ForemanPaths {
    pub root: PathBuf,
    pub foreman_dir: PathBuf,
    pub state_dir: PathBuf,
    pub passes_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub board_path: PathBuf,
    pub state_path: PathBuf,
    pub outbox_path: PathBuf,
    pub memory_path: PathBuf,
}

impl ForemanPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let foreman_dir = root.join(".foreman");
        let state_dir = foreman_dir.join("state");
        Self {
            root: root.clone(),
            foreman_dir: foreman_dir.clone(),
            state_dir: state_dir.clone(),
            passes_dir: foreman_dir.join("passes"),
            gitignore_path: foreman_dir.join(".gitignore"),
            config_path: foreman_dir.join("config.toml"),
            board_path: foreman_dir.join("board.json"),
            state_path: state_dir.join("state.json"),
            outbox_path: foreman_dir.join("outbox.jsonl"),
            memory_path: foreman_dir.join("memory.md"),
        }
    }

    /// Directory for one pass's artifacts (generator log, test log, proposal).
    pub fn pass_dir(&self, job_id: u64, pass: u32) -> PathBuf {
        self.passes_dir
            .join(format!("job-{job_id}"))
            .join(pass.to_string())
    }
}

/// Options for `init_foreman`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing orchestrator-owned files.
    pub force: bool,
}

/// Create `.foreman/` scaffolding in `root`.
///
/// Fails if `.foreman/` already exists unless `options.force` is set.
pub fn init_foreman(root: &Path, options: &InitOptions) -> Result<ForemanPaths> {
    let paths = ForemanPaths::new(root);
    if paths.foreman_dir.exists() && !options.force {
        return Err(anyhow!(
            "foreman init: .foreman already exists (use --force to overwrite)"
        ));
    }
    if paths.foreman_dir.exists() && !paths.foreman_dir.is_dir() {
        return Err(anyhow!("foreman init: .foreman exists but is not a directory"));
    }

    create_dir(&paths.foreman_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.passes_dir)?;

    // The whole directory is orchestrator-owned; nothing in it belongs in
    // the project's feature-branch commits.
    write_file(&paths.gitignore_path, "*\n")?;
    write_config(&paths.config_path, &ForemanConfig::default())?;
    FileBoard::write(&paths.board_path, &[])?;
    Store::new(&paths.state_path).save(&Ledger::default())?;
    write_file(&paths.memory_path, MEMORY_PLACEHOLDER)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const MEMORY_PLACEHOLDER: &str = "# Project memory\n\n";
