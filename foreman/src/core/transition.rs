//! The job state machine: events and the transition table.
//!
//! The controller is the only caller; all other components report outcomes
//! as [`JobEvent`]s and never touch a job's state field directly. An illegal
//! (state, event) pair is a [`TransitionError`], not a silent no-op.

use std::fmt;

use crate::core::job::JobState;
use crate::core::types::{MergeSignal, PassSignal, PermissionDecision};

/// Discrete events that drive a job through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The controller picked the job up and prepared its branch.
    Started,
    /// A pass produced a change and is about to run the test suite.
    TestsStarted,
    /// Outcome of one pass-loop iteration.
    PassResult(PassSignal),
    QuestionAnswered,
    QuestionExpired,
    PermissionResolved(PermissionDecision),
    /// The controller handed the job to the merge coordinator.
    MergeStarted,
    MergeResult(MergeSignal),
    /// Human re-approval after a conflicted merge.
    ReviewApproved,
    /// The pass ceiling was reached with no passing outcome.
    MaxPassesExceeded,
    /// A collaborator failed after bounded retries.
    CollaboratorFailed,
    /// Externally requested cancellation.
    Cancelled,
}

/// An event arrived in a state that has no edge for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: JobState,
    pub event: JobEvent,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no transition from '{}' on {:?}",
            self.from.as_str(),
            self.event
        )
    }
}

impl std::error::Error for TransitionError {}

/// Compute the successor state for `event` in `from`.
///
/// Pure: persistence, side effects, and cause bookkeeping belong to the
/// controller.
pub fn next_state(from: JobState, event: &JobEvent) -> Result<JobState, TransitionError> {
    use JobEvent as E;
    use JobState as S;

    // Cancellation is honored from every non-terminal state.
    if matches!(event, E::Cancelled) && !from.is_terminal() {
        return Ok(S::Blocked);
    }

    let next = match (from, event) {
        (S::Claimed, E::Started) => S::Generating,

        (S::Generating, E::TestsStarted) => S::TestingPass,
        (S::Generating, E::PassResult(PassSignal::BlockedQuestion)) => S::AwaitingAnswer,
        (S::Generating, E::PassResult(PassSignal::BlockedPermission)) => S::AwaitingPermission,
        (S::Generating, E::MaxPassesExceeded) => S::Blocked,
        (S::Generating, E::CollaboratorFailed) => S::Blocked,

        (S::TestingPass, E::PassResult(PassSignal::Passed)) => S::ReadyForReview,
        (S::TestingPass, E::PassResult(PassSignal::Failed)) => S::Generating,
        (S::TestingPass, E::CollaboratorFailed) => S::Blocked,

        (S::AwaitingAnswer, E::QuestionAnswered) => S::Generating,
        (S::AwaitingAnswer, E::QuestionExpired) => S::Blocked,

        (S::AwaitingPermission, E::PermissionResolved(PermissionDecision::Approved)) => {
            S::Generating
        }
        (S::AwaitingPermission, E::PermissionResolved(PermissionDecision::Denied)) => S::Blocked,

        (S::ReadyForReview, E::MergeStarted) => S::Merging,
        (S::ReadyForReview, E::CollaboratorFailed) => S::Blocked,

        (S::Merging, E::MergeResult(MergeSignal::Clean)) => S::Merged,
        (S::Merging, E::MergeResult(MergeSignal::Conflict)) => S::NeedsReReview,
        (S::Merging, E::MergeResult(MergeSignal::Failed)) => S::Blocked,
        (S::Merging, E::CollaboratorFailed) => S::Blocked,

        (S::NeedsReReview, E::ReviewApproved) => S::Merging,

        _ => {
            return Err(TransitionError {
                from,
                event: event.clone(),
            });
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_merged() {
        let mut state = JobState::Claimed;
        let script = [
            JobEvent::Started,
            JobEvent::TestsStarted,
            JobEvent::PassResult(PassSignal::Passed),
            JobEvent::MergeStarted,
            JobEvent::MergeResult(MergeSignal::Clean),
        ];
        for event in &script {
            state = next_state(state, event).expect("legal edge");
        }
        assert_eq!(state, JobState::Merged);
    }

    #[test]
    fn fail_loops_back_to_generating() {
        let state = next_state(JobState::TestingPass, &JobEvent::PassResult(PassSignal::Failed))
            .expect("legal edge");
        assert_eq!(state, JobState::Generating);
    }

    #[test]
    fn ready_for_review_only_reachable_via_pass() {
        // The only edge into ReadyForReview is a passing test verdict.
        let from_pass =
            next_state(JobState::TestingPass, &JobEvent::PassResult(PassSignal::Passed)).unwrap();
        assert_eq!(from_pass, JobState::ReadyForReview);

        let from_fail =
            next_state(JobState::TestingPass, &JobEvent::PassResult(PassSignal::Failed)).unwrap();
        assert_ne!(from_fail, JobState::ReadyForReview);

        let from_answer = next_state(JobState::AwaitingAnswer, &JobEvent::QuestionAnswered).unwrap();
        assert_ne!(from_answer, JobState::ReadyForReview);
    }

    #[test]
    fn question_edges() {
        assert_eq!(
            next_state(JobState::Generating, &JobEvent::PassResult(PassSignal::BlockedQuestion))
                .unwrap(),
            JobState::AwaitingAnswer
        );
        assert_eq!(
            next_state(JobState::AwaitingAnswer, &JobEvent::QuestionAnswered).unwrap(),
            JobState::Generating
        );
        assert_eq!(
            next_state(JobState::AwaitingAnswer, &JobEvent::QuestionExpired).unwrap(),
            JobState::Blocked
        );
    }

    #[test]
    fn permission_edges() {
        assert_eq!(
            next_state(
                JobState::Generating,
                &JobEvent::PassResult(PassSignal::BlockedPermission)
            )
            .unwrap(),
            JobState::AwaitingPermission
        );
        assert_eq!(
            next_state(
                JobState::AwaitingPermission,
                &JobEvent::PermissionResolved(PermissionDecision::Approved)
            )
            .unwrap(),
            JobState::Generating
        );
        assert_eq!(
            next_state(
                JobState::AwaitingPermission,
                &JobEvent::PermissionResolved(PermissionDecision::Denied)
            )
            .unwrap(),
            JobState::Blocked
        );
    }

    #[test]
    fn conflicted_merge_requires_re_approval() {
        let state = next_state(JobState::Merging, &JobEvent::MergeResult(MergeSignal::Conflict))
            .expect("legal edge");
        assert_eq!(state, JobState::NeedsReReview);

        let retried = next_state(state, &JobEvent::ReviewApproved).expect("legal edge");
        assert_eq!(retried, JobState::Merging);
    }

    #[test]
    fn cancellation_blocks_from_any_non_terminal_state() {
        for state in [
            JobState::Claimed,
            JobState::Generating,
            JobState::TestingPass,
            JobState::AwaitingAnswer,
            JobState::AwaitingPermission,
            JobState::ReadyForReview,
            JobState::Merging,
            JobState::NeedsReReview,
        ] {
            assert_eq!(next_state(state, &JobEvent::Cancelled).unwrap(), JobState::Blocked);
        }
    }

    #[test]
    fn terminal_states_reject_all_events() {
        for state in [JobState::Merged, JobState::Blocked] {
            for event in [
                JobEvent::Started,
                JobEvent::TestsStarted,
                JobEvent::PassResult(PassSignal::Passed),
                JobEvent::QuestionAnswered,
                JobEvent::ReviewApproved,
                JobEvent::Cancelled,
            ] {
                let err = next_state(state, &event).unwrap_err();
                assert_eq!(err.from, state);
            }
        }
    }

    #[test]
    fn no_edge_leaves_blocked_or_merged() {
        // Spot-check the error message mentions both sides.
        let err = next_state(JobState::Blocked, &JobEvent::Started).unwrap_err();
        assert!(err.to_string().contains("blocked"));
        assert!(err.to_string().contains("Started"));
    }
}
