//! One generate-and-test pass for a job.
//!
//! A pass has two phases the controller persists between: the generation
//! phase (which may instead surface a question or an unapproved artifact)
//! and the test phase. The loop itself never decides termination — it
//! reports outcomes and the controller enforces the pass ceiling.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::core::job::Job;
use crate::core::ledger::Ledger;
use crate::core::permission::Fingerprint;
use crate::core::types::TestVerdict;
use crate::io::clock::TimeSource;
use crate::io::config::ForemanConfig;
use crate::io::context::{ContextInputs, render_pass_context};
use crate::io::generator::{ChangeGenerator, PassRequest, Proposal};
use crate::io::init::ForemanPaths;
use crate::io::memory::ProjectMemory;
use crate::io::retry::with_retries;
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::permission_gate::{self, GateCheck};

/// Generation rounds allowed within one pass (approvals re-enter the same
/// pass without consuming its budget, but not forever).
const MAX_GENERATION_ROUNDS: u32 = 8;

/// What the generation phase of a pass produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The working tree holds a candidate change; run the tests.
    ChangeReady {
        summary: String,
        files_changed: Vec<String>,
    },
    /// Generation needs a human answer; does not consume a pass.
    NeedsAnswer { prompt: String },
    /// Generation produced an artifact that is not approved for execution;
    /// does not consume a pass.
    NeedsPermission { fingerprint: Fingerprint },
}

/// Collaborators the generation phase needs.
pub struct PassDeps<'a> {
    pub generator: &'a dyn ChangeGenerator,
    pub clock: &'a dyn TimeSource,
}

/// Run the generation phase of the next pass for `job`.
///
/// An artifact whose fingerprint is already approved continues the same
/// pass (next round); anything unapproved suspends without incrementing
/// the pass count. Transient generator failures are retried here and never
/// consume a pass.
pub fn generate_change(
    job: &Job,
    ledger: &mut Ledger,
    paths: &ForemanPaths,
    config: &ForemanConfig,
    deps: &PassDeps,
) -> Result<GenerationOutcome> {
    let pass_number = job.passes_used + 1;
    let pass_dir = paths.pass_dir(job.id, pass_number);
    fs::create_dir_all(&pass_dir)
        .with_context(|| format!("create pass dir {}", pass_dir.display()))?;

    let memory = ProjectMemory::new(&paths.memory_path).load()?;
    let answered = ledger.latest_answer_for_job(job.id);
    let mut context = render_pass_context(
        &ContextInputs {
            story_title: job.story_title.clone(),
            story_body: job.story_body.clone(),
            labels: job.story_labels.clone(),
            memory,
            failure: job.last_failure.clone(),
            question: answered.map(|q| q.prompt.clone()),
            answer: answered.and_then(|q| q.answer.clone()),
            pass_number,
            max_passes: config.max_passes,
        },
        config.context_budget_bytes,
    )?;

    for round in 1..=MAX_GENERATION_ROUNDS {
        let request = PassRequest {
            workdir: paths.root.clone(),
            context: context.clone(),
            pass: pass_number,
            round,
            output_path: pass_dir.join(format!("proposal-{round}.json")),
            log_path: pass_dir.join(format!("generator-{round}.log")),
            timeout: Duration::from_secs(config.generator_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        };

        let proposal = with_retries(
            "generator.propose",
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
            || deps.generator.propose(&request),
        )?;

        match proposal {
            Proposal::Change {
                summary,
                files_changed,
            } => {
                info!(job = job.id, pass = pass_number, round, "change ready");
                return Ok(GenerationOutcome::ChangeReady {
                    summary,
                    files_changed,
                });
            }
            Proposal::Question { prompt } => {
                info!(job = job.id, pass = pass_number, "generation needs an answer");
                return Ok(GenerationOutcome::NeedsAnswer { prompt });
            }
            Proposal::Permission { artifact } => {
                let fingerprint = artifact.fingerprint();
                match permission_gate::check(ledger, &artifact, deps.clock.now()) {
                    GateCheck::Approved => {
                        debug!(job = job.id, fingerprint = %fingerprint, "artifact already approved, continuing pass");
                        context.push_str(&format!(
                            "\n\nThe artifact `{}` is approved for execution. Continue.",
                            artifact.path
                        ));
                    }
                    GateCheck::Pending { newly_seen } => {
                        info!(
                            job = job.id,
                            fingerprint = %fingerprint,
                            newly_seen,
                            "generation needs permission"
                        );
                        return Ok(GenerationOutcome::NeedsPermission { fingerprint });
                    }
                    GateCheck::Denied => {
                        info!(job = job.id, fingerprint = %fingerprint, "artifact already denied");
                        return Ok(GenerationOutcome::NeedsPermission { fingerprint });
                    }
                }
            }
        }
    }

    Err(anyhow!(
        "generator produced {MAX_GENERATION_ROUNDS} rounds without a change for job {}",
        job.id
    ))
}

/// Run the test phase of the current pass.
pub fn run_tests(
    job: &Job,
    paths: &ForemanPaths,
    config: &ForemanConfig,
    tests: &dyn TestRunner,
) -> Result<TestVerdict> {
    let pass_number = job.passes_used + 1;
    let pass_dir = paths.pass_dir(job.id, pass_number);
    fs::create_dir_all(&pass_dir)
        .with_context(|| format!("create pass dir {}", pass_dir.display()))?;

    tests.run(&TestRequest {
        workdir: paths.root.clone(),
        log_path: pass_dir.join("test.log"),
        timeout: Duration::from_secs(config.test_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobState;
    use crate::core::permission::Artifact;
    use crate::core::types::PermissionDecision;
    use crate::io::init::{InitOptions, init_foreman};
    use crate::test_support::{FixedClock, ScriptedGenerator, job_in_state, t0};

    fn workspace() -> (tempfile::TempDir, ForemanPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_foreman(temp.path(), &InitOptions { force: false }).expect("init");
        (temp, paths)
    }

    fn artifact() -> Artifact {
        Artifact {
            path: "Dockerfile".to_string(),
            description: "build image".to_string(),
            content: "FROM rust:1.87\n".to_string(),
        }
    }

    #[test]
    fn change_proposal_is_ready_for_tests() {
        let (_temp, paths) = workspace();
        let mut ledger = Ledger::default();
        let job = job_in_state(1, 42, JobState::Generating);
        let generator = ScriptedGenerator::with_proposals(vec![Proposal::Change {
            summary: "implemented".to_string(),
            files_changed: vec!["src/lib.rs".to_string()],
        }]);
        let clock = FixedClock::new(t0());

        let outcome = generate_change(
            &job,
            &mut ledger,
            &paths,
            &ForemanConfig::default(),
            &PassDeps {
                generator: &generator,
                clock: &clock,
            },
        )
        .expect("generate");

        assert!(matches!(outcome, GenerationOutcome::ChangeReady { ref summary, .. } if summary == "implemented"));
    }

    #[test]
    fn question_proposal_suspends_without_permission_record() {
        let (_temp, paths) = workspace();
        let mut ledger = Ledger::default();
        let job = job_in_state(1, 42, JobState::Generating);
        let generator = ScriptedGenerator::with_proposals(vec![Proposal::Question {
            prompt: "Which database?".to_string(),
        }]);
        let clock = FixedClock::new(t0());

        let outcome = generate_change(
            &job,
            &mut ledger,
            &paths,
            &ForemanConfig::default(),
            &PassDeps {
                generator: &generator,
                clock: &clock,
            },
        )
        .expect("generate");

        assert!(matches!(outcome, GenerationOutcome::NeedsAnswer { ref prompt } if prompt == "Which database?"));
        assert!(ledger.permissions.is_empty());
    }

    #[test]
    fn unseen_artifact_records_pending_permission_and_suspends() {
        let (_temp, paths) = workspace();
        let mut ledger = Ledger::default();
        let job = job_in_state(1, 42, JobState::Generating);
        let generator = ScriptedGenerator::with_proposals(vec![Proposal::Permission {
            artifact: artifact(),
        }]);
        let clock = FixedClock::new(t0());

        let outcome = generate_change(
            &job,
            &mut ledger,
            &paths,
            &ForemanConfig::default(),
            &PassDeps {
                generator: &generator,
                clock: &clock,
            },
        )
        .expect("generate");

        assert_eq!(
            outcome,
            GenerationOutcome::NeedsPermission {
                fingerprint: artifact().fingerprint()
            }
        );
        assert_eq!(ledger.permissions.len(), 1);
    }

    #[test]
    fn approved_artifact_continues_the_same_pass() {
        let (_temp, paths) = workspace();
        let mut ledger = Ledger::default();
        let job = job_in_state(1, 42, JobState::Generating);
        let clock = FixedClock::new(t0());

        // Pre-approve the fingerprint, then script permission -> change.
        permission_gate::check(&mut ledger, &artifact(), t0());
        permission_gate::resolve(
            &mut ledger,
            &artifact().fingerprint(),
            PermissionDecision::Approved,
        )
        .expect("approve");

        let generator = ScriptedGenerator::with_proposals(vec![
            Proposal::Permission {
                artifact: artifact(),
            },
            Proposal::Change {
                summary: "done with docker".to_string(),
                files_changed: Vec::new(),
            },
        ]);

        let outcome = generate_change(
            &job,
            &mut ledger,
            &paths,
            &ForemanConfig::default(),
            &PassDeps {
                generator: &generator,
                clock: &clock,
            },
        )
        .expect("generate");

        assert!(matches!(outcome, GenerationOutcome::ChangeReady { .. }));
        // The second round saw the approval note in its context.
        let contexts = generator.contexts.borrow();
        assert_eq!(contexts.len(), 2);
        assert!(contexts[1].contains("approved for execution"));
    }

    #[test]
    fn endless_permission_rounds_are_an_error() {
        let (_temp, paths) = workspace();
        let mut ledger = Ledger::default();
        let job = job_in_state(1, 42, JobState::Generating);
        let clock = FixedClock::new(t0());

        permission_gate::check(&mut ledger, &artifact(), t0());
        permission_gate::resolve(
            &mut ledger,
            &artifact().fingerprint(),
            PermissionDecision::Approved,
        )
        .expect("approve");

        let generator = ScriptedGenerator::with_proposals(
            (0..MAX_GENERATION_ROUNDS)
                .map(|_| Proposal::Permission {
                    artifact: artifact(),
                })
                .collect(),
        );

        let err = generate_change(
            &job,
            &mut ledger,
            &paths,
            &ForemanConfig::default(),
            &PassDeps {
                generator: &generator,
                clock: &clock,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("without a change"));
    }
}
