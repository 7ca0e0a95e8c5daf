//! The manager actor: sole owner of the ledger, the registry and the ready queue.
//!
//! Every command and every completion is handled in one turn of this loop,
//! so no caller ever observes a half-applied update.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatch, Dispatcher};
use crate::context::CancelFlag;
use crate::domain::{
    JobEvent, JobId, JobOutcome, JobState, JobType, NewJob, ProgressBook, ProgressState,
};
use crate::error::ShuttleError;
use crate::ledger::{DependencyLedger, Effects};
use crate::observability::LedgerCounts;
use crate::registry::{Processor, ProcessorRegistry};

type Reply<T> = oneshot::Sender<Result<T, ShuttleError>>;

pub(crate) enum Command {
    AddJob {
        job: NewJob,
        reply: Reply<JobState>,
    },
    AddDependencies {
        id: JobId,
        deps: Vec<JobId>,
        reply: Reply<()>,
    },
    Finalize {
        ids: Vec<JobId>,
        reply: Reply<()>,
    },
    RegisterProcessor {
        job_type: JobType,
        processor: Arc<dyn Processor>,
        reply: Reply<()>,
    },
    Cancel {
        id: JobId,
        reply: Reply<bool>,
    },
    Status {
        id: JobId,
        reply: oneshot::Sender<Option<JobState>>,
    },
    Progress {
        id: JobId,
        reply: oneshot::Sender<Option<ProgressState>>,
    },
    Dependencies {
        id: JobId,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Counts {
        reply: oneshot::Sender<LedgerCounts>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from the pool or the market back to the manager.
pub(crate) enum Internal {
    Started(JobId),
    Progress { id: JobId, progress: ProgressState },
    Finished(JobOutcome),
}

struct InFlight {
    job_type: JobType,
    cancel: CancelFlag,
    cancel_requested: bool,
}

pub(super) struct ManagerActor {
    pub ledger: DependencyLedger,
    pub registry: ProcessorRegistry,
    pub dispatcher: Dispatcher,
    pub events: broadcast::Sender<JobEvent>,
    pub internal_tx: mpsc::UnboundedSender<Internal>,
    ready: VecDeque<JobId>,
    in_flight: HashMap<JobId, InFlight>,
    progress: ProgressBook,
}

impl ManagerActor {
    pub fn new(
        ledger: DependencyLedger,
        registry: ProcessorRegistry,
        dispatcher: Dispatcher,
        events: broadcast::Sender<JobEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
        progress_retention: usize,
    ) -> Self {
        Self {
            ledger,
            registry,
            dispatcher,
            events,
            internal_tx,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            progress: ProgressBook::new(progress_retention),
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                // Completions first: they free capacity and unblock dependents.
                biased;

                Some(msg) = internal.recv() => self.handle_internal(msg),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
            self.pump().await;
        }

        let counts = self.ledger.counts();
        info!(
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            unfinished = counts.unfinished(),
            in_flight = ?self.dispatcher.in_flight(),
            "job manager stopped"
        );
        // Bodies that poll their flag return early.
        for job in self.in_flight.values() {
            job.cancel.raise();
        }
        self.dispatcher.shutdown().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddJob { job, reply } => {
                let _ = reply.send(self.add_job(job));
            }
            Command::AddDependencies { id, deps, reply } => {
                let _ = reply.send(self.ledger.add_deps(&id, &deps));
            }
            Command::Finalize { ids, reply } => {
                let _ = reply.send(self.finalize_all(&ids));
            }
            Command::RegisterProcessor {
                job_type,
                processor,
                reply,
            } => {
                info!(%job_type, "processor registered");
                let _ = reply.send(self.registry.register(job_type, processor));
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(&id).await;
                let _ = reply.send(result);
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.ledger.state(&id));
            }
            Command::Progress { id, reply } => {
                let _ = reply.send(self.progress.get(&id).cloned());
            }
            Command::Dependencies { id, reply } => {
                let _ = reply.send(self.ledger.dependencies_of(&id));
            }
            Command::Counts { reply } => {
                let _ = reply.send(self.ledger.counts());
            }
            // Handled by the loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn add_job(&mut self, job: NewJob) -> Result<JobState, ShuttleError> {
        let NewJob {
            id,
            job_type,
            payload,
            depends_on,
            join,
        } = job;
        self.ledger
            .declare(id.clone(), job_type, payload, &depends_on)?;
        if !join {
            let effects = self.ledger.finalize(&id)?;
            self.apply_effects(effects);
        }
        Ok(self.ledger.state(&id).unwrap_or(JobState::Declared))
    }

    /// Every id is processed; the first error is returned.
    fn finalize_all(&mut self, ids: &[JobId]) -> Result<(), ShuttleError> {
        let mut first_err = None;
        for id in ids {
            match self.ledger.finalize(id) {
                Ok(effects) => self.apply_effects(effects),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "finalize failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn cancel(&mut self, id: &JobId) -> Result<bool, ShuttleError> {
        let state = self
            .ledger
            .state(id)
            .ok_or_else(|| ShuttleError::UnknownJob(id.clone()))?;
        if state.is_terminal() {
            return Ok(false);
        }

        if let Some(job) = self.in_flight.get_mut(id) {
            if job.cancel_requested {
                return Ok(true);
            }
            job.cancel_requested = true;
            job.cancel.raise();
            let acknowledged = self
                .registry
                .get(&job.job_type)
                .is_some_and(|processor| processor.cancel(id));
            info!(job_id = %id, acknowledged, "cancel requested for in-flight job");
            self.dispatcher.cancel(id).await;
            return Ok(true);
        }

        // Not dispatched yet: the processor never sees it.
        self.ready.retain(|r| r != id);
        let job_type = self.ledger.job_type(id).cloned();
        let effects = self.ledger.mark_failed(id, JobState::Cancelled, "cancelled")?;
        if let Some(job_type) = job_type {
            self.emit(JobEvent::Finished(JobOutcome::cancelled(id.clone(), job_type)));
        }
        info!(job_id = %id, %state, "job cancelled before dispatch");
        self.apply_effects(effects);
        Ok(true)
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Started(id) => {
                if let Err(e) = self.ledger.mark_running(&id) {
                    debug!(job_id = %id, error = %e, "start not recorded");
                }
            }
            Internal::Progress { id, progress } => {
                self.progress.update(id.clone(), progress.clone());
                self.emit(JobEvent::Progress { id, progress });
            }
            Internal::Finished(outcome) => self.finish(outcome),
        }
    }

    fn finish(&mut self, outcome: JobOutcome) {
        if self.in_flight.remove(&outcome.id).is_none() {
            warn!(job_id = %outcome.id, "completion for a job that is not in flight");
            return;
        }
        self.dispatcher.release();

        let result = if outcome.success {
            info!(job_id = %outcome.id, job_type = %outcome.job_type, "job completed");
            self.ledger.mark_completed(&outcome.id)
        } else {
            let reason = outcome.error.clone().unwrap_or_default();
            warn!(
                job_id = %outcome.id,
                job_type = %outcome.job_type,
                state = %outcome.state,
                %reason,
                "job did not complete"
            );
            self.ledger.mark_failed(&outcome.id, outcome.state, reason)
        };

        self.progress
            .finish(&outcome.id, outcome.success, outcome.error.as_deref());

        match result {
            Ok(effects) => {
                self.emit(JobEvent::Finished(outcome));
                self.apply_effects(effects);
            }
            Err(e) => warn!(job_id = %outcome.id, error = %e, "ledger rejected completion"),
        }
    }

    /// Queue promoted jobs and report cascaded failures.
    fn apply_effects(&mut self, effects: Effects) {
        for job in effects.failed {
            warn!(job_id = %job.id, reason = %job.reason, "job failed by dependency");
            self.emit(JobEvent::Finished(JobOutcome::failed(
                job.id,
                job.job_type,
                job.reason,
            )));
        }
        for job in effects.ready {
            debug!(job_id = %job.id, job_type = %job.job_type, "job ready");
            self.ready.push_back(job.id.clone());
            self.emit(JobEvent::Ready {
                id: job.id,
                job_type: job.job_type,
            });
        }
    }

    /// Dispatch ready jobs while the dispatcher has room.
    async fn pump(&mut self) {
        while self.dispatcher.has_capacity() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            if let Err(e) = self.dispatch_one(&id).await {
                warn!(job_id = %id, error = %e, "dispatch failed");
                self.fail_before_run(&id, e);
            }
        }
    }

    async fn dispatch_one(&mut self, id: &JobId) -> Result<(), ShuttleError> {
        let Some(record) = self.ledger.record(id) else {
            return Err(ShuttleError::UnknownJob(id.clone()));
        };
        let job_type = record.job_type.clone();
        let payload = Arc::new(record.payload.clone());

        let processor = self
            .registry
            .get(&job_type)
            .cloned()
            .ok_or_else(|| ShuttleError::UnregisteredType(job_type.clone()))?;
        if !processor.precheck(id, &payload) {
            return Err(ShuttleError::PrecheckFailed(id.clone()));
        }

        self.ledger.mark_dispatched(id)?;
        let cancel = CancelFlag::new();
        self.in_flight.insert(
            id.clone(),
            InFlight {
                job_type: job_type.clone(),
                cancel: cancel.clone(),
                cancel_requested: false,
            },
        );
        info!(job_id = %id, %job_type, "job dispatched");
        self.emit(JobEvent::Dispatched {
            id: id.clone(),
            job_type: job_type.clone(),
        });

        let job = Dispatch {
            id: id.clone(),
            job_type,
            payload,
            cancel,
            processor,
        };
        if let Err(e) = self.dispatcher.dispatch(job, &self.internal_tx).await {
            self.in_flight.remove(id);
            return Err(e);
        }
        Ok(())
    }

    /// A job that never reached a worker fails like any other.
    fn fail_before_run(&mut self, id: &JobId, error: ShuttleError) {
        let Some(job_type) = self.ledger.job_type(id).cloned() else {
            return;
        };
        match self.ledger.mark_failed(id, JobState::Failed, error.to_string()) {
            Ok(effects) => {
                self.emit(JobEvent::Finished(JobOutcome::failed(
                    id.clone(),
                    job_type,
                    error.to_string(),
                )));
                self.apply_effects(effects);
            }
            Err(e) => warn!(job_id = %id, error = %e, "could not record failure"),
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
