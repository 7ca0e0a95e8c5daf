use serde::{Deserialize, Serialize};

use crate::domain::JobState;

/// Per-state job counts, including retired terminal jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub declared: usize,
    pub waiting: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,

    /// Ids referenced as dependencies but never declared.
    pub placeholders: usize,
}

impl LedgerCounts {
    pub(crate) fn add(&mut self, state: JobState) {
        let slot = match state {
            JobState::Declared => &mut self.declared,
            JobState::Waiting => &mut self.waiting,
            JobState::Ready => &mut self.ready,
            JobState::Dispatched => &mut self.dispatched,
            JobState::Running => &mut self.running,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    /// Jobs that have not reached a terminal state.
    pub fn unfinished(&self) -> usize {
        self.declared + self.waiting + self.ready + self.dispatched + self.running
    }
}

/// Snapshot of the job market.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCounts {
    /// Submissions waiting for a worker, all types.
    pub queued: usize,

    /// Workers announced and not yet matched, all types.
    pub idle_workers: usize,

    /// Jobs assigned to a worker and not yet reported back.
    pub in_flight: usize,
}
