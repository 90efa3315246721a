//! Ledger invariant checks for `foreman validate`.
//!
//! These mirror the guarantees the controller and gates maintain at runtime;
//! violations indicate a corrupted store or a bug, never normal operation.

use std::collections::HashSet;

use crate::core::job::JobState;
use crate::core::ledger::Ledger;
use crate::core::question::QuestionStatus;

/// Check all ledger invariants. Returns human-readable violations (empty =
/// valid).
pub fn validate_invariants(ledger: &Ledger, max_passes: u32) -> Vec<String> {
    let mut errors = Vec::new();

    let mut job_ids = HashSet::new();
    let mut active_stories = HashSet::new();
    for job in &ledger.jobs {
        if !job_ids.insert(job.id) {
            errors.push(format!("duplicate job id {}", job.id));
        }
        if !job.state.is_terminal() && !active_stories.insert(job.story_id) {
            errors.push(format!(
                "story {} has more than one non-terminal job",
                job.story_id
            ));
        }
        if job.passes_used > max_passes {
            errors.push(format!(
                "job {}: passes_used {} exceeds max_passes {}",
                job.id, job.passes_used, max_passes
            ));
        }
        if job.state == JobState::Blocked && job.block_cause.is_none() {
            errors.push(format!("job {}: blocked without a cause", job.id));
        }
        if job.state == JobState::AwaitingPermission {
            match &job.pending_fingerprint {
                None => errors.push(format!(
                    "job {}: awaiting permission without a pending fingerprint",
                    job.id
                )),
                Some(fingerprint) if ledger.permission(fingerprint).is_none() => {
                    errors.push(format!(
                        "job {}: pending fingerprint {} has no permission record",
                        job.id, fingerprint
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let mut question_ids = HashSet::new();
    let mut pending_jobs = HashSet::new();
    for question in &ledger.questions {
        if !question_ids.insert(question.id) {
            errors.push(format!("duplicate question id {}", question.id));
        }
        if ledger.job(question.job_id).is_none() {
            errors.push(format!(
                "question {}: unknown job {}",
                question.id, question.job_id
            ));
        }
        if question.is_pending() && !pending_jobs.insert(question.job_id) {
            errors.push(format!(
                "job {} has more than one pending question",
                question.job_id
            ));
        }
        if question.status == QuestionStatus::Answered && question.answer.is_none() {
            errors.push(format!("question {}: answered without answer text", question.id));
        }
    }

    let mut fingerprints = HashSet::new();
    for record in &ledger.permissions {
        if !fingerprints.insert(record.fingerprint.as_str()) {
            errors.push(format!("duplicate permission record {}", record.fingerprint));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobState;
    use crate::test_support::{job_in_state, pending_question};

    #[test]
    fn empty_ledger_is_valid() {
        assert!(validate_invariants(&Ledger::default(), 5).is_empty());
    }

    #[test]
    fn rejects_two_active_jobs_for_one_story() {
        let mut ledger = Ledger::default();
        ledger.jobs.push(job_in_state(1, 42, JobState::Generating));
        ledger.jobs.push(job_in_state(2, 42, JobState::AwaitingAnswer));

        let errors = validate_invariants(&ledger, 5);
        assert!(errors.iter().any(|e| e.contains("more than one non-terminal job")));
    }

    #[test]
    fn rejects_pass_count_above_ceiling() {
        let mut ledger = Ledger::default();
        let mut job = job_in_state(1, 42, JobState::Generating);
        job.passes_used = 6;
        ledger.jobs.push(job);

        let errors = validate_invariants(&ledger, 5);
        assert!(errors.iter().any(|e| e.contains("exceeds max_passes")));
    }

    #[test]
    fn rejects_two_pending_questions_for_one_job() {
        let mut ledger = Ledger::default();
        ledger.jobs.push(job_in_state(1, 42, JobState::AwaitingAnswer));
        ledger.questions.push(pending_question(1, 1, "first?"));
        ledger.questions.push(pending_question(2, 1, "second?"));

        let errors = validate_invariants(&ledger, 5);
        assert!(errors.iter().any(|e| e.contains("more than one pending question")));
    }

    #[test]
    fn rejects_blocked_job_without_cause() {
        let mut ledger = Ledger::default();
        ledger.jobs.push(job_in_state(1, 42, JobState::Blocked));

        let errors = validate_invariants(&ledger, 5);
        assert!(errors.iter().any(|e| e.contains("blocked without a cause")));
    }
}
