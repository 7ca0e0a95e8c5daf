use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobRecord, JobState, JobType};

/// What happens to the dependents of a job that failed or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dependents fail too: immediately if finalized, otherwise at finalize.
    #[default]
    Block,

    /// A failed or cancelled dependency counts as resolved.
    Release,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(FailurePolicy::Block),
            "release" => Ok(FailurePolicy::Release),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// One arena slot.
///
/// Design:
/// - `pending`: forward edges that are not resolved yet (job -> dependency)
/// - `dependents`: reverse edges (dependency -> jobs waiting for it)
/// - Invariant: `a.pending` contains `b` iff `b.dependents` contains `a`
#[derive(Debug)]
pub(super) struct Node {
    pub id: JobId,

    /// `None` for a forward-declared placeholder.
    pub record: Option<JobRecord>,

    /// Every dependency ever declared, in declaration order.
    pub deps: Vec<JobId>,

    pub pending: BTreeSet<usize>,
    pub dependents: BTreeSet<usize>,

    /// Set when a dependency failed under `FailurePolicy::Block`.
    pub blocked_by: Option<JobId>,
}

impl Node {
    pub fn placeholder(id: JobId) -> Self {
        Self {
            id,
            record: None,
            deps: Vec::new(),
            pending: BTreeSet::new(),
            dependents: BTreeSet::new(),
            blocked_by: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.record.is_none()
    }

    pub fn state(&self) -> Option<JobState> {
        self.record.as_ref().map(|r| r.state)
    }

    pub fn is_finalized(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.finalized)
    }

    /// Finalized, not blocked, nothing pending, still waiting.
    pub fn can_promote(&self) -> bool {
        self.is_finalized()
            && self.pending.is_empty()
            && self.blocked_by.is_none()
            && self.state() == Some(JobState::Waiting)
    }
}

/// A job promoted into the ready queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promoted {
    pub id: JobId,
    pub job_type: JobType,
}

/// A job failed because one of its dependencies failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cascaded {
    pub id: JobId,
    pub job_type: JobType,
    pub reason: String,
}

/// Side effects of one ledger mutation, for the manager to act on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Effects {
    pub ready: Vec<Promoted>,
    pub failed: Vec<Cascaded>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.failed.is_empty()
    }

    pub fn ready_ids(&self) -> Vec<JobId> {
        self.ready.iter().map(|p| p.id.clone()).collect()
    }

    pub fn failed_ids(&self) -> Vec<JobId> {
        self.failed.iter().map(|c| c.id.clone()).collect()
    }

    pub(super) fn extend(&mut self, other: Effects) {
        self.ready.extend(other.ready);
        self.failed.extend(other.failed);
    }
}
