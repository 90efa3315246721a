//! Code-generation collaborator: one proposal per generation round.
//!
//! The [`ChangeGenerator`] trait decouples the pass loop from the actual
//! agent backend. The process-backed [`CommandGenerator`] feeds the rendered
//! pass context on stdin and expects a proposal JSON at the request's output
//! path, validated against a bundled schema. Tests use scripted generators
//! that return predetermined proposals without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::permission::Artifact;
use crate::io::process::run_with_timeout;

const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");

/// Parameters for one generation round.
#[derive(Debug, Clone)]
pub struct PassRequest {
    /// Working directory the generator may edit (the repository root).
    pub workdir: PathBuf,
    /// Rendered context: memory, story, prior failure, answered question.
    pub context: String,
    /// Pass number this round belongs to (1-indexed).
    pub pass: u32,
    /// Round number within the pass (1-indexed; >1 after an approval).
    pub round: u32,
    /// Path where the generator must write its proposal JSON.
    pub output_path: PathBuf,
    /// Path to write generator stdout/stderr.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Closed set of things a generation round can produce.
///
/// Consumed exhaustively by the pass loop; there is no string-keyed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Proposal {
    /// The working tree was edited; run the tests.
    Change {
        summary: String,
        #[serde(default)]
        files_changed: Vec<String>,
    },
    /// Generation cannot proceed without a human answer.
    Question { prompt: String },
    /// A new artifact needs approval before it may be executed.
    Permission { artifact: Artifact },
}

/// Abstraction over generation backends.
pub trait ChangeGenerator {
    fn propose(&self, request: &PassRequest) -> Result<Proposal>;
}

/// Generator that spawns a configured command.
pub struct CommandGenerator {
    command: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl ChangeGenerator for CommandGenerator {
    fn propose(&self, request: &PassRequest) -> Result<Proposal> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("generator.command is not configured"))?;
        info!(
            command = ?self.command,
            pass = request.pass,
            round = request.round,
            "starting generator"
        );

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .arg("--output")
            .arg(&request.output_path)
            .current_dir(&request.workdir);

        let output = run_with_timeout(
            cmd,
            Some(request.context.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run generator command")?;

        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create generator log dir {}", parent.display()))?;
        }
        fs::write(&request.log_path, output.render_log())
            .with_context(|| format!("write generator log {}", request.log_path.display()))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "generator timed out");
            return Err(anyhow!(
                "generator timed out after {:?}",
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}",
                output.status.code()
            ));
        }

        load_proposal(&request.output_path)
    }
}

/// Read and validate a proposal file.
pub fn load_proposal(path: &Path) -> Result<Proposal> {
    if !path.exists() {
        return Err(anyhow!("missing proposal output {}", path.display()));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read proposal {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_proposal_schema(&instance)?;
    let proposal: Proposal = serde_json::from_value(instance)
        .with_context(|| format!("parse {} as proposal", path.display()))?;
    debug!(kind = proposal_kind(&proposal), "parsed proposal");
    Ok(proposal)
}

fn proposal_kind(proposal: &Proposal) -> &'static str {
    match proposal {
        Proposal::Change { .. } => "change",
        Proposal::Question { .. } => "question",
        Proposal::Permission { .. } => "permission",
    }
}

/// Validate a proposal JSON instance against the bundled schema
/// (Draft 2020-12).
fn validate_proposal_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile proposal schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("proposal schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
