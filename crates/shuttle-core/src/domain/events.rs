//! Events pushed to subscribers, and the completion message shape.

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job::{JobState, Payload};
use super::job_type::JobType;
use super::outcome::Outcome;
use super::progress::ProgressState;

/// Completion message for one job.
///
/// Failures travel the same channel as successes: `success == false` and
/// `error` carries the message. There is no separate error channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
}

impl JobOutcome {
    pub fn completed(id: JobId, job_type: JobType, result: Option<Payload>) -> Self {
        Self {
            id,
            job_type,
            state: JobState::Completed,
            success: true,
            error: None,
            result,
        }
    }

    pub fn failed(id: JobId, job_type: JobType, error: impl Into<String>) -> Self {
        Self {
            id,
            job_type,
            state: JobState::Failed,
            success: false,
            error: Some(error.into()),
            result: None,
        }
    }

    pub fn cancelled(id: JobId, job_type: JobType) -> Self {
        Self {
            id,
            job_type,
            state: JobState::Cancelled,
            success: false,
            error: Some("cancelled".to_string()),
            result: None,
        }
    }

    /// Build the completion message from a processor outcome.
    pub fn from_outcome(id: JobId, job_type: JobType, outcome: Outcome) -> Self {
        if outcome.is_success() {
            Self::completed(id, job_type, outcome.result)
        } else {
            let reason = outcome
                .reason
                .unwrap_or_else(|| "job failed".to_string());
            Self::failed(id, job_type, reason)
        }
    }
}

/// Scheduler events, pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// All dependencies resolved; the job entered the ready queue.
    Ready { id: JobId, job_type: JobType },

    /// The job left the ready queue for the pool or the market.
    Dispatched { id: JobId, job_type: JobType },

    Progress { id: JobId, progress: ProgressState },

    Finished(JobOutcome),
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Ready { id, .. }
            | JobEvent::Dispatched { id, .. }
            | JobEvent::Progress { id, .. } => id,
            JobEvent::Finished(outcome) => &outcome.id,
        }
    }
}
