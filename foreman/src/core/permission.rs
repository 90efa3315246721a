//! Permission records for generated artifacts, keyed by content fingerprint.
//!
//! A record is process-wide and shared across jobs: once a human approves a
//! fingerprint, no later job is ever asked about the same content again.

use std::fmt;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable content-derived key identifying a generated artifact.
///
/// Lowercase hex SHA-256 of the artifact's canonical content. Two artifacts
/// with identical content share one fingerprint regardless of which job
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_content(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Wrap an already-computed hex digest (e.g. from a CLI argument).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A generated artifact that requires approval before it may be executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Repository-relative path the artifact was written to.
    pub path: String,
    /// Short human-readable description of what the artifact does.
    pub description: String,
    /// Canonical content used for fingerprinting.
    pub content: String,
}

impl Artifact {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_content(&self.content)
    }
}

/// Approval status of a permission record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Denied,
}

/// One permission decision, shared across all jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub fingerprint: Fingerprint,
    pub status: PermissionStatus,
    pub artifact_path: String,
    pub description: String,
    pub first_seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_content() {
        let a = Fingerprint::of_content("FROM rust:1.87\n");
        let b = Fingerprint::of_content("FROM rust:1.87\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn fingerprint_differs_for_different_content() {
        let a = Fingerprint::of_content("FROM rust:1.87\n");
        let b = Fingerprint::of_content("FROM rust:1.88\n");
        assert_ne!(a, b);
    }

    #[test]
    fn artifact_fingerprint_ignores_path_and_description() {
        let a = Artifact {
            path: "Dockerfile".to_string(),
            description: "build image".to_string(),
            content: "FROM rust:1.87\n".to_string(),
        };
        let b = Artifact {
            path: "docker/Dockerfile".to_string(),
            description: "same content, different location".to_string(),
            content: "FROM rust:1.87\n".to_string(),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
