//! Child-process execution with timeouts and bounded output capture.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Combined stdout/stderr, rendered for a log file.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.timed_out {
            buf.push_str("\n[timed out]\n");
        }
        buf
    }

    /// Tail of the combined output, bounded to `limit` bytes. The tail is
    /// what matters when a test run fails late.
    pub fn combined_tail(&self, limit: usize) -> String {
        let combined = self.render_log();
        if combined.len() <= limit {
            return combined.trim().to_string();
        }
        let mut start = combined.len() - limit;
        while start < combined.len() && !combined.is_char_boundary(start) {
            start += 1;
        }
        format!("[... truncated ...]\n{}", combined[start..].trim())
    }
}

/// Run a command with a timeout, feeding `stdin` if given.
///
/// Stdout and stderr are drained concurrently so a chatty child never
/// deadlocks on a full pipe; at most `output_limit_bytes` of each stream is
/// retained. The child is killed on timeout.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(timeout_secs = timeout.as_secs(), "spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = stdout_handle
        .join()
        .map_err(|_| anyhow!("stdout reader panicked"))?
        .context("read stdout")?;
    let stderr = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr reader panicked"))?
        .context("read stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

/// Drain a stream to completion, keeping at most `limit` bytes.
fn drain_limited(mut stream: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(kept);
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        // Keep reading past the limit so the child never blocks on a full pipe.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let out = run_with_timeout(sh("echo hello"), None, Duration::from_secs(5), 1000)
            .expect("run");
        assert!(out.status.success());
        assert!(!out.timed_out);
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_with_timeout(sh("sleep 30"), None, Duration::from_millis(100), 1000)
            .expect("run");
        assert!(out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_with_timeout(sh("cat"), Some(b"ping"), Duration::from_secs(5), 1000)
            .expect("run");
        assert_eq!(String::from_utf8_lossy(&out.stdout), "ping");
    }

    #[test]
    fn bounds_captured_output() {
        let out = run_with_timeout(
            sh("yes x | head -c 100000"),
            None,
            Duration::from_secs(10),
            64,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout.len(), 64);
    }

    #[test]
    fn combined_tail_keeps_the_end() {
        let out = run_with_timeout(
            sh("printf 'first\\n'; printf 'last\\n' >&2; exit 1"),
            None,
            Duration::from_secs(5),
            1000,
        )
        .expect("run");
        assert!(!out.status.success());
        let tail = out.combined_tail(4096);
        assert!(tail.contains("first"));
        assert!(tail.contains("last"));
    }
}
