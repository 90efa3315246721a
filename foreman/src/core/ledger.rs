//! The in-memory ledger: all jobs, questions, and permission records.
//!
//! The ledger is plain data. Durability (atomic load/save) lives in
//! [`crate::io::store`]; the controller persists the whole ledger after every
//! transition so one rename commits one transition.

use serde::{Deserialize, Serialize};

use crate::core::job::Job;
use crate::core::permission::{Fingerprint, PermissionRecord};
use crate::core::question::Question;

/// Complete orchestrator state for one target repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ledger {
    pub jobs: Vec<Job>,
    pub questions: Vec<Question>,
    pub permissions: Vec<PermissionRecord>,
    pub next_job_id: u64,
    pub next_question_id: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            questions: Vec::new(),
            permissions: Vec::new(),
            next_job_id: 1,
            next_question_id: 1,
        }
    }
}

impl Ledger {
    pub fn job(&self, id: u64) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// The non-terminal job for a story, if one exists.
    pub fn active_job_for_story(&self, story_id: u64) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|j| j.story_id == story_id && !j.state.is_terminal())
    }

    pub fn question(&self, id: u64) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn question_mut(&mut self, id: u64) -> Option<&mut Question> {
        self.questions.iter_mut().find(|q| q.id == id)
    }

    /// The pending question for a job, if any. The gate guarantees at most one.
    pub fn pending_question_for_job(&self, job_id: u64) -> Option<&Question> {
        self.questions
            .iter()
            .find(|q| q.job_id == job_id && q.is_pending())
    }

    /// The most recent answered question for a job (context for the next pass).
    pub fn latest_answer_for_job(&self, job_id: u64) -> Option<&Question> {
        self.questions
            .iter()
            .filter(|q| q.job_id == job_id && q.answer.is_some())
            .max_by_key(|q| q.id)
    }

    pub fn permission(&self, fingerprint: &Fingerprint) -> Option<&PermissionRecord> {
        self.permissions.iter().find(|p| &p.fingerprint == fingerprint)
    }

    pub fn permission_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut PermissionRecord> {
        self.permissions
            .iter_mut()
            .find(|p| &p.fingerprint == fingerprint)
    }

    pub fn allocate_job_id(&mut self) -> u64 {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    pub fn allocate_question_id(&mut self) -> u64 {
        let id = self.next_question_id;
        self.next_question_id += 1;
        id
    }
}
