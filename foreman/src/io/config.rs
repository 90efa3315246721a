//! Orchestrator configuration stored under `.foreman/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Maximum generate-and-test passes per job.
    pub max_passes: u32,

    /// Minutes a pending question may wait for a human answer.
    pub question_timeout_minutes: u64,

    /// Integration branch that pull requests target.
    pub base_branch: String,

    /// Protected branch that must never receive a direct merge.
    pub trunk_branch: String,

    /// Wall-clock budget for one generation round in seconds.
    pub generator_timeout_secs: u64,

    /// Wall-clock budget for one test-suite run in seconds.
    pub test_timeout_secs: u64,

    /// Truncate subprocess stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Byte budget for the rendered pass context.
    pub context_budget_bytes: usize,

    /// Soft token budget for project memory (approx 4 chars per token).
    pub memory_budget_tokens: usize,

    /// Bounded retries for transient collaborator failures.
    pub retry_attempts: u32,

    /// Base delay between retries in milliseconds (grows linearly).
    pub retry_delay_ms: u64,

    pub generator: GeneratorConfig,
    pub test: TestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that produces a proposal (context on stdin, JSON at the
    /// output path). Empty until the operator configures a backend.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Command that runs the project's test suite (e.g. `["just", "ci"]`).
    pub command: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            max_passes: 5,
            question_timeout_minutes: 30,
            base_branch: "develop".to_string(),
            trunk_branch: "main".to_string(),
            generator_timeout_secs: 30 * 60,
            test_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            context_budget_bytes: 40_000,
            memory_budget_tokens: 2000,
            retry_attempts: 3,
            retry_delay_ms: 500,
            generator: GeneratorConfig::default(),
            test: TestConfig::default(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(anyhow!("max_passes must be > 0"));
        }
        if self.question_timeout_minutes == 0 {
            return Err(anyhow!("question_timeout_minutes must be > 0"));
        }
        if self.generator_timeout_secs == 0 || self.test_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.base_branch.trim().is_empty() || self.trunk_branch.trim().is_empty() {
            return Err(anyhow!("base_branch and trunk_branch must be non-empty"));
        }
        if self.base_branch == self.trunk_branch {
            return Err(anyhow!(
                "base_branch must differ from the protected trunk_branch"
            ));
        }
        if self.test.command.is_empty() || self.test.command[0].trim().is_empty() {
            return Err(anyhow!("test.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');

    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ForemanConfig::default();
        cfg.max_passes = 3;
        cfg.generator.command = vec!["agent".to_string(), "propose".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_base_equal_to_trunk() {
        let mut cfg = ForemanConfig::default();
        cfg.base_branch = "main".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("trunk_branch"));
    }

    #[test]
    fn validate_rejects_zero_max_passes() {
        let mut cfg = ForemanConfig::default();
        cfg.max_passes = 0;
        assert!(cfg.validate().is_err());
    }
}
