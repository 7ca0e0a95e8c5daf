//! Job record and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job_type::JobType;

/// Opaque job payload. Handed to workers as an immutable snapshot at dispatch.
pub type Payload = serde_json::Value;

/// Job state.
///
/// State transitions:
/// - Declared -> (edges added) -> Waiting | Ready       (on finalize)
/// - Waiting -> Ready                                    (last dependency completes)
/// - Ready -> Dispatched -> Running -> Completed | Failed | Cancelled
/// - any non-terminal state -> Cancelled | Failed        (cancel, failed dependency)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Declared but not finalized: more dependency edges may arrive.
    Declared,

    /// Finalized, waiting for at least one dependency.
    Waiting,

    /// Finalized and every dependency resolved; sitting in the ready queue.
    Ready,

    /// Handed to the local pool or the market, not yet picked up.
    Dispatched,

    /// A worker is executing the job body.
    Running,

    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Has the job left the scheduler's hands (pool or market)?
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Dispatched | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Declared => "declared",
            JobState::Waiting => "waiting",
            JobState::Ready => "ready",
            JobState::Dispatched => "dispatched",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Metadata + payload for a job in the ledger.
///
/// This is the single source of truth for job state. Queue structures
/// (ready queue, pool, market) hold ids only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Payload,
    pub state: JobState,

    /// Monotonic: once set, never unset.
    pub finalized: bool,

    /// Last error message (failed or cancelled jobs).
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, job_type: JobType, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type,
            payload,
            state: JobState::Declared,
            finalized: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
        self.touch();
    }

    pub fn transition(&mut self, state: JobState) {
        self.state = state;
        self.touch();
    }

    pub fn fail(&mut self, state: JobState, error: impl Into<String>) {
        self.state = state;
        self.last_error = Some(error.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
