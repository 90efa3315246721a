//! Question gate: suspend a job on a human clarification.
//!
//! Asking is non-blocking at this layer: the gate records a pending question
//! with a wall-clock deadline and delivers the prompt to the notifier;
//! suspension is the controller entering `AwaitingAnswer`, never a blocked
//! call. Answers and expiry come back through [`resolve`] and [`sweep`].

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::ledger::Ledger;
use crate::core::question::{Question, QuestionStatus};
use crate::io::outbox::{Note, Notifier};

/// Result of resolving a question with an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The answer was recorded in time.
    Answered,
    /// The question was already answered; the new answer is discarded.
    AlreadyAnswered,
    /// The deadline had elapsed (possibly detected lazily just now); the
    /// answer is a no-op.
    Expired,
}

/// Create a pending question for a job and deliver the prompt.
///
/// A job has at most one pending question; a second `ask` while one is
/// pending is a bug in the caller.
pub fn ask(
    ledger: &mut Ledger,
    job_id: u64,
    prompt: &str,
    timeout: chrono::Duration,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> Result<u64> {
    if let Some(existing) = ledger.pending_question_for_job(job_id) {
        return Err(anyhow!(
            "job {job_id} already has pending question {}",
            existing.id
        ));
    }

    let id = ledger.allocate_question_id();
    let question = Question {
        id,
        job_id,
        prompt: prompt.to_string(),
        status: QuestionStatus::Pending,
        answer: None,
        asked_at: now,
        deadline: now + timeout,
    };
    info!(question = id, job = job_id, deadline = %question.deadline, "question asked");
    ledger.questions.push(question);

    notifier.post(&Note::question(job_id, prompt), now)?;
    Ok(id)
}

/// Record a human answer.
///
/// The deadline is re-checked here rather than trusting any scheduled
/// callback, so a stale wait expires correctly even if no sweep ran.
pub fn resolve(
    ledger: &mut Ledger,
    question_id: u64,
    answer: &str,
    now: DateTime<Utc>,
) -> Result<ResolveOutcome> {
    let question = ledger
        .question_mut(question_id)
        .ok_or_else(|| anyhow!("unknown question {question_id}"))?;

    match question.status {
        QuestionStatus::Answered => {
            debug!(question = question_id, "answer ignored: already answered");
            Ok(ResolveOutcome::AlreadyAnswered)
        }
        QuestionStatus::Expired => {
            debug!(question = question_id, "answer ignored: already expired");
            Ok(ResolveOutcome::Expired)
        }
        QuestionStatus::Pending if now > question.deadline => {
            warn!(question = question_id, "answer arrived after deadline, expiring");
            question.status = QuestionStatus::Expired;
            Ok(ResolveOutcome::Expired)
        }
        QuestionStatus::Pending => {
            question.status = QuestionStatus::Answered;
            question.answer = Some(answer.to_string());
            info!(question = question_id, job = question.job_id, "question answered");
            Ok(ResolveOutcome::Answered)
        }
    }
}

/// Expire pending questions whose deadline has elapsed.
///
/// Returns the ids of questions that expired in this call, each exactly
/// once: already-expired questions are skipped, so repeated sweeps are
/// idempotent.
pub fn sweep(ledger: &mut Ledger, now: DateTime<Utc>) -> Vec<u64> {
    let mut expired = Vec::new();
    for question in &mut ledger.questions {
        if question.is_expired_at(now) {
            question.status = QuestionStatus::Expired;
            info!(question = question.id, job = question.job_id, "question expired");
            expired.push(question.id);
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobState;
    use crate::test_support::{RecordingNotifier, job_in_state, t0};

    fn ledger_with_job() -> Ledger {
        let mut ledger = Ledger::default();
        ledger.jobs.push(job_in_state(1, 42, JobState::Generating));
        ledger
    }

    #[test]
    fn ask_records_pending_question_and_posts_prompt() {
        let mut ledger = ledger_with_job();
        let notifier = RecordingNotifier::default();

        let id = ask(
            &mut ledger,
            1,
            "Which auth scheme?",
            chrono::Duration::minutes(30),
            &notifier,
            t0(),
        )
        .expect("ask");

        let question = ledger.question(id).expect("question");
        assert!(question.is_pending());
        assert_eq!(question.deadline, t0() + chrono::Duration::minutes(30));
        assert_eq!(notifier.notes.borrow().len(), 1);
    }

    #[test]
    fn second_pending_question_is_rejected() {
        let mut ledger = ledger_with_job();
        let notifier = RecordingNotifier::default();
        ask(&mut ledger, 1, "first?", chrono::Duration::minutes(30), &notifier, t0())
            .expect("ask");

        let err = ask(&mut ledger, 1, "second?", chrono::Duration::minutes(30), &notifier, t0())
            .unwrap_err();
        assert!(err.to_string().contains("pending question"));
    }

    #[test]
    fn timely_answer_is_recorded() {
        let mut ledger = ledger_with_job();
        let notifier = RecordingNotifier::default();
        let id = ask(&mut ledger, 1, "q?", chrono::Duration::minutes(30), &notifier, t0())
            .expect("ask");

        let outcome = resolve(&mut ledger, id, "use tokens", t0() + chrono::Duration::minutes(5))
            .expect("resolve");
        assert_eq!(outcome, ResolveOutcome::Answered);
        assert_eq!(
            ledger.question(id).unwrap().answer.as_deref(),
            Some("use tokens")
        );
    }

    #[test]
    fn late_answer_is_a_no_op() {
        let mut ledger = ledger_with_job();
        let notifier = RecordingNotifier::default();
        let id = ask(&mut ledger, 1, "q?", chrono::Duration::minutes(30), &notifier, t0())
            .expect("ask");

        let outcome = resolve(&mut ledger, id, "too late", t0() + chrono::Duration::minutes(31))
            .expect("resolve");
        assert_eq!(outcome, ResolveOutcome::Expired);
        assert!(ledger.question(id).unwrap().answer.is_none());

        // Status is now immutable: a second answer changes nothing.
        let outcome = resolve(&mut ledger, id, "still late", t0() + chrono::Duration::hours(2))
            .expect("resolve");
        assert_eq!(outcome, ResolveOutcome::Expired);
    }

    #[test]
    fn sweep_expires_exactly_once() {
        let mut ledger = ledger_with_job();
        let notifier = RecordingNotifier::default();
        let id = ask(&mut ledger, 1, "q?", chrono::Duration::minutes(30), &notifier, t0())
            .expect("ask");

        let before = sweep(&mut ledger, t0() + chrono::Duration::minutes(29));
        assert!(before.is_empty());

        let first = sweep(&mut ledger, t0() + chrono::Duration::minutes(31));
        assert_eq!(first, vec![id]);

        // Idempotent under repeated sweeps.
        let second = sweep(&mut ledger, t0() + chrono::Duration::minutes(32));
        assert!(second.is_empty());
    }
}
