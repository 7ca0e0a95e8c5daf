//! Messages exchanged with the market actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::context::CancelFlag;
use crate::domain::{JobId, JobOutcome, JobType, Payload, ProgressState, WorkerId};
use crate::observability::MarketCounts;

/// What the market pushes back to a producer.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Completed(JobOutcome),
    Progress { id: JobId, progress: ProgressState },
}

/// Where results for one submission go. Unbounded: the market never waits
/// on a slow producer.
pub type ReplyAddr = mpsc::UnboundedSender<ProducerEvent>;

/// A job offered to the market.
#[derive(Debug)]
pub struct Submission {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Arc<Payload>,
    pub reply_to: ReplyAddr,
}

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Arc<Payload>,

    /// Raised when the job is cancelled while assigned.
    pub cancel: CancelFlag,
}

#[derive(Debug)]
pub enum MarketCommand {
    Submit(Submission),

    /// One idle announcement is good for exactly one assignment.
    WorkerIdle {
        job_type: JobType,
        worker: WorkerId,
        inbox: oneshot::Sender<Assignment>,
    },

    ReportResult(JobOutcome),

    ReportProgress {
        id: JobId,
        progress: ProgressState,
    },

    GetProgress {
        id: JobId,
        reply: oneshot::Sender<Option<ProgressState>>,
    },

    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },

    Counts {
        reply: oneshot::Sender<MarketCounts>,
    },

    Shutdown,
}
