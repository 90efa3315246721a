//! Scheduler: claim the next eligible story and create its job.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info};

use crate::core::job::{Job, JobState};
use crate::core::ledger::Ledger;
use crate::io::board::{Board, StoryRef};
use crate::io::clock::TimeSource;
use crate::io::config::ForemanConfig;

/// Claim the highest-priority ready story and create its job.
///
/// Candidates are visited in board order (position, then id). A story with
/// a live job is skipped, and a lost claim race is skipped silently — the
/// scheduler simply tries the next candidate. Returns the new job's id, or
/// `None` when no story could be claimed this tick.
///
/// The caller persists the ledger; the board claim itself is atomic at the
/// board, which is what prevents two ticks from double-claiming a story.
pub fn claim_next(
    ledger: &mut Ledger,
    board: &dyn Board,
    config: &ForemanConfig,
    clock: &dyn TimeSource,
) -> Result<Option<u64>> {
    let mut candidates = board.list_ready()?;
    candidates.sort_by_key(|s| (s.position, s.id));

    for story in candidates {
        if let Some(job) = ledger.active_job_for_story(story.id) {
            debug!(story = story.id, job = job.id, "skipping story with live job");
            continue;
        }
        if !board.claim(story.id)? {
            debug!(story = story.id, "lost claim race, trying next candidate");
            continue;
        }

        let now = clock.now();
        let base_branch = determine_base_branch(ledger, config);
        let job = Job {
            id: ledger.allocate_job_id(),
            story_id: story.id,
            story_title: story.title.clone(),
            story_body: story.body.clone(),
            story_labels: story.labels.clone(),
            state: JobState::Claimed,
            passes_used: 0,
            branch: branch_name(&story),
            base_branch,
            pr_number: None,
            last_failure: None,
            pending_fingerprint: None,
            block_cause: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        };
        info!(job = job.id, story = story.id, branch = %job.branch, base = %job.base_branch, "story claimed");
        let id = job.id;
        ledger.jobs.push(job);
        return Ok(Some(id));
    }

    debug!("no claimable story this tick");
    Ok(None)
}

/// Base branch for a new job: stack on the newest in-review feature branch
/// when one exists, otherwise the configured integration branch.
fn determine_base_branch(ledger: &Ledger, config: &ForemanConfig) -> String {
    ledger
        .jobs
        .iter()
        .filter(|j| {
            j.pr_number.is_some()
                && matches!(
                    j.state,
                    JobState::ReadyForReview | JobState::Merging | JobState::NeedsReReview
                )
        })
        .max_by_key(|j| j.id)
        .map(|j| j.branch.clone())
        .unwrap_or_else(|| config.base_branch.clone())
}

/// Generate a branch name from story details: `feature/<id>-<slug>` or
/// `bug/<id>-<slug>` when a `bug` label is present.
pub fn branch_name(story: &StoryRef) -> String {
    let prefix = if story.labels.iter().any(|l| l.eq_ignore_ascii_case("bug")) {
        "bug"
    } else {
        "feature"
    };
    format!("{prefix}/{}-{}", story.id, slugify(&story.title, 40))
}

fn slugify(text: &str, max_length: usize) -> String {
    static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
    let lower = text.to_lowercase();
    let slug = NON_ALNUM.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    let mut end = slug.len().min(max_length);
    while end > 0 && !slug.is_char_boundary(end) {
        end -= 1;
    }
    slug[..end].trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::board::{FileBoard, StoryStatus};
    use crate::test_support::{FixedClock, job_in_state, story, t0};

    fn board_with(temp: &tempfile::TempDir, stories: &[StoryRef]) -> FileBoard {
        let path = temp.path().join("board.json");
        FileBoard::write(&path, stories).expect("write board");
        FileBoard::new(path)
    }

    #[test]
    fn claims_highest_priority_ready_story() {
        let temp = tempfile::tempdir().expect("tempdir");
        let board = board_with(&temp, &[story(2, "Second", 1), story(1, "First story", 0)]);
        let mut ledger = Ledger::default();
        let clock = FixedClock::new(t0());

        let job_id = claim_next(&mut ledger, &board, &ForemanConfig::default(), &clock)
            .expect("claim")
            .expect("job created");

        let job = ledger.job(job_id).expect("job");
        assert_eq!(job.story_id, 1);
        assert_eq!(job.state, JobState::Claimed);
        assert_eq!(job.branch, "feature/1-first-story");
        assert_eq!(job.base_branch, "develop");

        // The story left Ready; exactly one job exists for it.
        assert!(board.list_ready().expect("list").iter().all(|s| s.id != 1));
    }

    #[test]
    fn skips_story_with_live_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let board = board_with(&temp, &[story(1, "First", 0), story(2, "Second", 1)]);
        let mut ledger = Ledger::default();
        ledger.jobs.push(job_in_state(9, 1, JobState::Generating));
        let clock = FixedClock::new(t0());

        let job_id = claim_next(&mut ledger, &board, &ForemanConfig::default(), &clock)
            .expect("claim")
            .expect("job created");
        assert_eq!(ledger.job(job_id).unwrap().story_id, 2);
    }

    /// A board whose claim of story 1 always loses, as if a concurrent tick
    /// grabbed it between `list_ready` and `claim`.
    struct RacyBoard {
        inner: FileBoard,
    }

    impl Board for RacyBoard {
        fn list_ready(&self) -> anyhow::Result<Vec<StoryRef>> {
            self.inner.list_ready()
        }

        fn claim(&self, story_id: u64) -> anyhow::Result<bool> {
            if story_id == 1 {
                return Ok(false);
            }
            self.inner.claim(story_id)
        }

        fn set_status(&self, story_id: u64, status: StoryStatus) -> anyhow::Result<()> {
            self.inner.set_status(story_id, status)
        }
    }

    #[test]
    fn lost_claim_race_moves_to_next_candidate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let board = RacyBoard {
            inner: board_with(&temp, &[story(1, "First", 0), story(2, "Second", 1)]),
        };
        let mut ledger = Ledger::default();
        let clock = FixedClock::new(t0());

        let job_id = claim_next(&mut ledger, &board, &ForemanConfig::default(), &clock)
            .expect("claim")
            .expect("job created");
        assert_eq!(ledger.job(job_id).unwrap().story_id, 2);
        // Exactly one job was created for the successful claim.
        assert_eq!(ledger.jobs.len(), 1);
    }

    #[test]
    fn returns_none_when_nothing_is_ready() {
        let temp = tempfile::tempdir().expect("tempdir");
        let board = board_with(&temp, &[]);
        let mut ledger = Ledger::default();
        let clock = FixedClock::new(t0());

        let result =
            claim_next(&mut ledger, &board, &ForemanConfig::default(), &clock).expect("claim");
        assert!(result.is_none());
        assert!(ledger.jobs.is_empty());
    }

    #[test]
    fn stacks_on_newest_in_review_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let board = board_with(&temp, &[story(3, "Third", 0)]);
        let mut ledger = Ledger::default();
        let mut in_review = job_in_state(1, 1, JobState::ReadyForReview);
        in_review.branch = "feature/1-first".to_string();
        in_review.pr_number = Some(4);
        ledger.jobs.push(in_review);
        // Keep the id allocator consistent with the pre-seeded job: a real
        // ledger holding job id 1 always has next_job_id past it, otherwise
        // the next claim collides with this fixture's id.
        ledger.next_job_id = 2;
        let clock = FixedClock::new(t0());

        let job_id = claim_next(&mut ledger, &board, &ForemanConfig::default(), &clock)
            .expect("claim")
            .expect("job created");
        assert_eq!(ledger.job(job_id).unwrap().base_branch, "feature/1-first");
    }

    #[test]
    fn bug_label_selects_bug_prefix() {
        let mut s = story(7, "Fix the totals: rounding!", 0);
        s.labels = vec!["Bug".to_string()];
        assert_eq!(branch_name(&s), "bug/7-fix-the-totals-rounding");
    }

    #[test]
    fn slugify_collapses_and_truncates() {
        assert_eq!(slugify("Hello,   World! — again", 40), "hello-world-again");
        assert_eq!(slugify("x".repeat(60).as_str(), 10), "xxxxxxxxxx");
        assert_eq!(slugify("---", 40), "");
    }
}
