//! Test-suite adapter: run the project's tests, classify pass/fail.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::types::TestVerdict;
use crate::io::process::run_with_timeout;

/// Bytes of test output carried into the next pass's context.
const FAILURE_SUMMARY_LIMIT: usize = 4_000;

/// Parameters for one test-suite run.
#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Working directory (the repository root).
    pub workdir: PathBuf,
    /// Path to write the full test log.
    pub log_path: PathBuf,
    /// Maximum time to wait; the suite is killed past this (also the
    /// cancellation bound for an aborted job).
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over test execution backends.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestVerdict>;
}

/// Runs a configurable command (e.g. `just ci`) and maps its exit status to
/// a verdict. A timeout is a failing verdict, not an error: the job keeps
/// its retry budget semantics.
pub struct CommandTestRunner {
    command: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestVerdict> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("test command is empty"))?;
        info!(command = ?self.command, workdir = %request.workdir.display(), "running test suite");

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]).current_dir(&request.workdir);
        let output = run_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .context("run test command")?;

        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create test log dir {}", parent.display()))?;
        }
        fs::write(&request.log_path, output.render_log())
            .with_context(|| format!("write test log {}", request.log_path.display()))?;

        if output.timed_out {
            return Ok(TestVerdict {
                passed: false,
                failure_summary: format!(
                    "test run timed out after {}s",
                    request.timeout.as_secs()
                ),
            });
        }

        let passed = output.status.success();
        debug!(passed, exit_code = ?output.status.code(), "test suite finished");
        Ok(TestVerdict {
            passed,
            failure_summary: if passed {
                String::new()
            } else {
                output.combined_tail(FAILURE_SUMMARY_LIMIT)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &tempfile::TempDir) -> TestRequest {
        TestRequest {
            workdir: temp.path().to_path_buf(),
            log_path: temp.path().join("test.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn passing_command_yields_passing_verdict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(vec!["true".to_string()]);

        let verdict = runner.run(&request(&temp)).expect("run");
        assert!(verdict.passed);
        assert!(verdict.failure_summary.is_empty());
        assert!(temp.path().join("test.log").exists());
    }

    #[test]
    fn failing_command_carries_output_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'FAILED tests/test_x.py::test_totals'; exit 1".to_string(),
        ]);

        let verdict = runner.run(&request(&temp)).expect("run");
        assert!(!verdict.passed);
        assert!(verdict.failure_summary.contains("test_totals"));
    }

    #[test]
    fn timeout_is_a_failing_verdict_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(vec!["sleep".to_string(), "30".to_string()]);

        let mut req = request(&temp);
        req.timeout = Duration::from_millis(100);
        let verdict = runner.run(&req).expect("run");
        assert!(!verdict.passed);
        assert!(verdict.failure_summary.contains("timed out"));
    }
}
