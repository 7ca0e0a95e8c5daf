use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{
    DEFAULT_PROGRESS_RETENTION, JobId, JobOutcome, JobType, Payload, ProducerId, ProgressBook,
    ProgressState,
};
use crate::error::ShuttleError;
use crate::market::{MarketHandle, ProducerEvent, ReplyAddr, Submission};

/// A job as handed to a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub id: JobId,
    pub job_type: JobType,

    #[serde(default)]
    pub payload: Payload,
}

impl SubmittedJob {
    pub fn new(id: impl Into<JobId>, job_type: impl Into<JobType>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload,
        }
    }
}

type CompletionHandler = Box<dyn Fn(&JobOutcome) + Send + Sync>;
type ProgressHandler = Box<dyn Fn(&JobId, &ProgressState) + Send + Sync>;

enum PumpCommand {
    OnCompletion(CompletionHandler),
    OnProgress(ProgressHandler),
    GetProgress {
        id: JobId,
        reply: oneshot::Sender<Option<ProgressState>>,
    },
}

/// Submits jobs to a market and receives their results.
///
/// A pump task owns the handlers and the latest progress per job; the
/// producer itself only sends messages to it.
pub struct Producer {
    id: ProducerId,
    market: MarketHandle,
    reply_to: ReplyAddr,
    pump: mpsc::UnboundedSender<PumpCommand>,
    join: JoinHandle<()>,
}

impl Producer {
    pub fn new(market: MarketHandle) -> Self {
        Self::with_progress_retention(market, DEFAULT_PROGRESS_RETENTION)
    }

    /// Keep terminal progress for at most `retention` finished jobs.
    pub fn with_progress_retention(market: MarketHandle, retention: usize) -> Self {
        let id = ProducerId::generate();
        let (reply_to, events) = mpsc::unbounded_channel();
        let (pump, commands) = mpsc::unbounded_channel();
        let join = tokio::spawn(pump_loop(id, events, commands, ProgressBook::new(retention)));
        Self {
            id,
            market,
            reply_to,
            pump,
            join,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    /// Offer a job to the market. Returns once the market has the submission.
    pub async fn add_job(&self, job: SubmittedJob) -> Result<(), ShuttleError> {
        self.add_job_shared(job.id, job.job_type, Arc::new(job.payload))
            .await
    }

    pub(crate) async fn add_job_shared(
        &self,
        id: JobId,
        job_type: JobType,
        payload: Arc<Payload>,
    ) -> Result<(), ShuttleError> {
        debug!(producer_id = %self.id, job_id = %id, "submitting job");
        self.market
            .submit(Submission {
                id,
                job_type,
                payload,
                reply_to: self.reply_to.clone(),
            })
            .await
    }

    /// Called once per finished job, success or failure.
    pub fn add_job_completion_handler<F>(&self, handler: F) -> Result<(), ShuttleError>
    where
        F: Fn(&JobOutcome) + Send + Sync + 'static,
    {
        self.command(PumpCommand::OnCompletion(Box::new(handler)))
    }

    pub fn add_progress_handler<F>(&self, handler: F) -> Result<(), ShuttleError>
    where
        F: Fn(&JobId, &ProgressState) + Send + Sync + 'static,
    {
        self.command(PumpCommand::OnProgress(Box::new(handler)))
    }

    /// Latest progress seen for one of this producer's jobs.
    pub async fn get_progress(&self, id: JobId) -> Result<Option<ProgressState>, ShuttleError> {
        let (reply, rx) = oneshot::channel();
        self.command(PumpCommand::GetProgress { id, reply })?;
        rx.await.map_err(|_| ShuttleError::Closed("producer"))
    }

    pub fn market(&self) -> &MarketHandle {
        &self.market
    }

    fn command(&self, cmd: PumpCommand) -> Result<(), ShuttleError> {
        self.pump
            .send(cmd)
            .map_err(|_| ShuttleError::Closed("producer"))
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn pump_loop(
    id: ProducerId,
    mut events: mpsc::UnboundedReceiver<ProducerEvent>,
    mut commands: mpsc::UnboundedReceiver<PumpCommand>,
    mut progress: ProgressBook,
) {
    let mut on_completion: Vec<CompletionHandler> = Vec::new();
    let mut on_progress: Vec<ProgressHandler> = Vec::new();

    loop {
        tokio::select! {
            // Handlers registered before a result must see it.
            biased;

            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    PumpCommand::OnCompletion(h) => on_completion.push(h),
                    PumpCommand::OnProgress(h) => on_progress.push(h),
                    PumpCommand::GetProgress { id, reply } => {
                        let _ = reply.send(progress.get(&id).cloned());
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ProducerEvent::Progress { id, progress: state } => {
                        for h in &on_progress {
                            h(&id, &state);
                        }
                        progress.update(id, state);
                    }
                    ProducerEvent::Completed(outcome) => {
                        progress.finish(&outcome.id, outcome.success, outcome.error.as_deref());
                        if on_completion.is_empty() {
                            warn!(producer_id = %id, job_id = %outcome.id, "no completion handler");
                        }
                        for h in &on_completion {
                            h(&outcome);
                        }
                    }
                }
            }
        }
    }
    debug!(producer_id = %id, "producer pump stopped");
}
