use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{Assignment, MarketCommand, ProducerEvent, ReplyAddr, Submission};
use crate::config::MarketConfig;
use crate::context::CancelFlag;
use crate::domain::{JobId, JobOutcome, JobType, ProgressState, WorkerId};
use crate::error::ShuttleError;
use crate::observability::MarketCounts;

struct IdleWorker {
    worker: WorkerId,
    inbox: oneshot::Sender<Assignment>,
}

struct InFlight {
    worker: WorkerId,
    reply_to: ReplyAddr,
    cancel: CancelFlag,
}

/// Market state. Owned by the actor task; never shared.
#[derive(Default)]
pub struct JobMarket {
    queued: HashMap<JobType, VecDeque<Submission>>,
    idle: HashMap<JobType, VecDeque<IdleWorker>>,
    in_flight: HashMap<JobId, InFlight>,
    progress: HashMap<JobId, ProgressState>,
    /// Ids that are queued or in flight.
    active: HashSet<JobId>,
}

impl JobMarket {
    /// Spawn the market actor and return its handle.
    pub fn spawn(config: &MarketConfig) -> (MarketHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let join = tokio::spawn(Self::default().run(rx));
        (MarketHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<MarketCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                MarketCommand::Submit(submission) => self.submit(submission),
                MarketCommand::WorkerIdle {
                    job_type,
                    worker,
                    inbox,
                } => self.worker_idle(job_type, IdleWorker { worker, inbox }),
                MarketCommand::ReportResult(outcome) => self.report_result(outcome),
                MarketCommand::ReportProgress { id, progress } => {
                    self.report_progress(id, progress)
                }
                MarketCommand::GetProgress { id, reply } => {
                    let _ = reply.send(self.progress.get(&id).cloned());
                }
                MarketCommand::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(&id));
                }
                MarketCommand::Counts { reply } => {
                    let _ = reply.send(self.counts());
                }
                MarketCommand::Shutdown => break,
            }
        }
        info!(
            queued = self.queued.values().map(VecDeque::len).sum::<usize>(),
            in_flight = self.in_flight.len(),
            "job market stopped"
        );
    }

    /// Assign to the longest-idle worker of this type, or queue.
    ///
    /// An id that is already queued or in flight is refused: the new
    /// submitter gets a failed result and the existing job keeps its route.
    fn submit(&mut self, submission: Submission) {
        if !self.active.insert(submission.id.clone()) {
            warn!(job_id = %submission.id, "duplicate submission refused");
            let message = format!("job {} is already queued or in flight", submission.id);
            let outcome = JobOutcome::failed(submission.id, submission.job_type, message);
            let _ = submission.reply_to.send(ProducerEvent::Completed(outcome));
            return;
        }
        debug!(job_id = %submission.id, job_type = %submission.job_type, "job submitted");
        let mut submission = submission;
        while let Some(worker) = self
            .idle
            .get_mut(&submission.job_type)
            .and_then(VecDeque::pop_front)
        {
            match self.assign(submission, worker) {
                Ok(()) => return,
                Err(back) => submission = back,
            }
        }
        self.queued
            .entry(submission.job_type.clone())
            .or_default()
            .push_back(submission);
    }

    /// Hand the oldest queued job of this type to `worker`, or park the worker.
    fn worker_idle(&mut self, job_type: JobType, worker: IdleWorker) {
        if worker.inbox.is_closed() {
            return;
        }
        let next = self
            .queued
            .get_mut(&job_type)
            .and_then(VecDeque::pop_front);
        match next {
            Some(submission) => {
                if let Err(back) = self.assign(submission, worker) {
                    // Worker went away between the check and the send.
                    self.queued.entry(job_type).or_default().push_front(back);
                }
            }
            None => {
                debug!(worker_id = %worker.worker, %job_type, "worker idle");
                self.idle.entry(job_type).or_default().push_back(worker);
            }
        }
    }

    /// Returns the submission when the worker's inbox is closed.
    fn assign(&mut self, submission: Submission, worker: IdleWorker) -> Result<(), Submission> {
        let cancel = CancelFlag::new();
        let assignment = Assignment {
            id: submission.id.clone(),
            job_type: submission.job_type.clone(),
            payload: submission.payload.clone(),
            cancel: cancel.clone(),
        };
        if worker.inbox.send(assignment).is_err() {
            debug!(worker_id = %worker.worker, "skipping closed worker");
            return Err(submission);
        }
        info!(
            job_id = %submission.id,
            job_type = %submission.job_type,
            worker_id = %worker.worker,
            "job assigned"
        );
        self.in_flight.insert(
            submission.id,
            InFlight {
                worker: worker.worker,
                reply_to: submission.reply_to,
                cancel,
            },
        );
        Ok(())
    }

    fn report_result(&mut self, outcome: JobOutcome) {
        self.progress.remove(&outcome.id);
        let Some(job) = self.in_flight.remove(&outcome.id) else {
            warn!(job_id = %outcome.id, "result for a job that is not in flight");
            return;
        };
        self.active.remove(&outcome.id);
        debug!(
            job_id = %outcome.id,
            worker_id = %job.worker,
            success = outcome.success,
            "result reported"
        );
        if job.reply_to.send(ProducerEvent::Completed(outcome)).is_err() {
            warn!("producer went away before its result arrived");
        }
    }

    fn report_progress(&mut self, id: JobId, progress: ProgressState) {
        let Some(job) = self.in_flight.get(&id) else {
            debug!(job_id = %id, "progress for a job that is not in flight");
            return;
        };
        let _ = job.reply_to.send(ProducerEvent::Progress {
            id: id.clone(),
            progress: progress.clone(),
        });
        self.progress.insert(id, progress);
    }

    /// Queued: removed and reported cancelled. Assigned: flag raised.
    fn cancel(&mut self, id: &JobId) -> bool {
        if let Some(job) = self.in_flight.get(id) {
            job.cancel.raise();
            info!(job_id = %id, "cancel signalled to worker");
            return true;
        }
        for queue in self.queued.values_mut() {
            if let Some(pos) = queue.iter().position(|s| &s.id == id) {
                let Some(submission) = queue.remove(pos) else {
                    continue;
                };
                self.active.remove(id);
                let outcome = JobOutcome::cancelled(submission.id, submission.job_type);
                let _ = submission.reply_to.send(ProducerEvent::Completed(outcome));
                info!(job_id = %id, "queued job cancelled");
                return true;
            }
        }
        false
    }

    fn counts(&self) -> MarketCounts {
        MarketCounts {
            queued: self.queued.values().map(VecDeque::len).sum(),
            idle_workers: self
                .idle
                .values()
                .flat_map(|q| q.iter())
                .filter(|w| !w.inbox.is_closed())
                .count(),
            in_flight: self.in_flight.len(),
        }
    }
}

/// Cloneable handle to the market actor.
#[derive(Debug, Clone)]
pub struct MarketHandle {
    tx: mpsc::Sender<MarketCommand>,
}

impl MarketHandle {
    async fn send(&self, cmd: MarketCommand) -> Result<(), ShuttleError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ShuttleError::Closed("job market"))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MarketCommand,
    ) -> Result<T, ShuttleError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| ShuttleError::Closed("job market"))
    }

    pub async fn submit(&self, submission: Submission) -> Result<(), ShuttleError> {
        self.send(MarketCommand::Submit(submission)).await
    }

    /// Announce `worker` idle for `job_type`. The receiver yields its next job.
    pub async fn worker_idle(
        &self,
        job_type: JobType,
        worker: WorkerId,
    ) -> Result<oneshot::Receiver<Assignment>, ShuttleError> {
        let (inbox, rx) = oneshot::channel();
        self.send(MarketCommand::WorkerIdle {
            job_type,
            worker,
            inbox,
        })
        .await?;
        Ok(rx)
    }

    pub async fn report_result(&self, outcome: JobOutcome) -> Result<(), ShuttleError> {
        self.send(MarketCommand::ReportResult(outcome)).await
    }

    pub async fn report_progress(
        &self,
        id: JobId,
        progress: ProgressState,
    ) -> Result<(), ShuttleError> {
        self.send(MarketCommand::ReportProgress { id, progress })
            .await
    }

    /// For callers on a blocking thread (job bodies).
    pub fn report_progress_blocking(
        &self,
        id: JobId,
        progress: ProgressState,
    ) -> Result<(), ShuttleError> {
        self.tx
            .blocking_send(MarketCommand::ReportProgress { id, progress })
            .map_err(|_| ShuttleError::Closed("job market"))
    }

    /// Latest progress reported for an in-flight job.
    pub async fn progress(&self, id: JobId) -> Result<Option<ProgressState>, ShuttleError> {
        self.request(|reply| MarketCommand::GetProgress { id, reply })
            .await
    }

    pub async fn cancel(&self, id: JobId) -> Result<bool, ShuttleError> {
        self.request(|reply| MarketCommand::Cancel { id, reply })
            .await
    }

    pub async fn counts(&self) -> Result<MarketCounts, ShuttleError> {
        self.request(|reply| MarketCommand::Counts { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), ShuttleError> {
        self.send(MarketCommand::Shutdown).await
    }
}
