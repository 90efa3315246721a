//! Bounded retries for transient collaborator failures.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Run `op`, retrying up to `attempts` times with linearly growing delay.
///
/// Intended for network-shaped collaborator calls (board updates, review
/// host, generation backends). Retries never consume a pass; when the
/// budget is exhausted the last error escalates to the caller with the
/// label attached.
pub fn with_retries<T>(
    label: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, attempts, error = %err, "collaborator call failed");
                last_err = Some(err);
                if attempt < attempts {
                    thread::sleep(base_delay * attempt);
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
        .with_context(|| format!("{label} failed after {attempts} attempts"))
}
