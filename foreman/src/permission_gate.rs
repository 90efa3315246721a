//! Permission gate: approval records for generated artifacts.
//!
//! Records are shared process-wide and keyed by content fingerprint, never
//! by job: once a fingerprint is approved, no later job is asked again, and
//! a denied fingerprint blocks whichever job produces it.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::ledger::Ledger;
use crate::core::permission::{Artifact, Fingerprint, PermissionRecord, PermissionStatus};
use crate::core::types::PermissionDecision;

/// Gate decision for an artifact the pass loop wants to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCheck {
    /// Previously approved; execution may proceed.
    Approved,
    /// Awaiting a human decision. `newly_seen` is true when this call
    /// created the record.
    Pending { newly_seen: bool },
    /// Previously denied; the owning job must block.
    Denied,
}

/// Look up (or create) the permission record for an artifact.
pub fn check(ledger: &mut Ledger, artifact: &Artifact, now: DateTime<Utc>) -> GateCheck {
    let fingerprint = artifact.fingerprint();
    if let Some(record) = ledger.permission(&fingerprint) {
        debug!(fingerprint = %fingerprint, status = ?record.status, "permission record found");
        return match record.status {
            PermissionStatus::Approved => GateCheck::Approved,
            PermissionStatus::Pending => GateCheck::Pending { newly_seen: false },
            PermissionStatus::Denied => GateCheck::Denied,
        };
    }

    info!(fingerprint = %fingerprint, path = %artifact.path, "new artifact, recording pending permission");
    ledger.permissions.push(PermissionRecord {
        fingerprint,
        status: PermissionStatus::Pending,
        artifact_path: artifact.path.clone(),
        description: artifact.description.clone(),
        first_seen_at: now,
    });
    GateCheck::Pending { newly_seen: true }
}

/// Record a human decision for a fingerprint.
///
/// Decisions are immutable: resolving an already-resolved record is an
/// error unless it repeats the same decision (idempotent redelivery).
pub fn resolve(
    ledger: &mut Ledger,
    fingerprint: &Fingerprint,
    decision: PermissionDecision,
) -> Result<PermissionStatus> {
    let record = ledger
        .permission_mut(fingerprint)
        .ok_or_else(|| anyhow!("unknown permission record {fingerprint}"))?;

    let target = match decision {
        PermissionDecision::Approved => PermissionStatus::Approved,
        PermissionDecision::Denied => PermissionStatus::Denied,
    };

    match record.status {
        PermissionStatus::Pending => {
            record.status = target;
            info!(fingerprint = %fingerprint, status = ?target, "permission resolved");
            Ok(target)
        }
        status if status == target => {
            debug!(fingerprint = %fingerprint, "permission decision repeated");
            Ok(status)
        }
        status => Err(anyhow!(
            "permission record {fingerprint} already resolved as {status:?}"
        )),
    }
}
