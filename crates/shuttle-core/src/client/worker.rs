use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{JobContext, ProgressReporter};
use crate::domain::{JobOutcome, JobType, WorkerId};
use crate::market::{Assignment, MarketHandle};
use crate::registry::{ProcessorRegistry, execute};

/// Market worker slots.
///
/// - `slots_per_type` slots are spawned for every registered job type
/// - dropping or signalling `shutdown_tx` stops every slot after its current job
/// - `shutdown_and_join()` waits for all slots
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<WorkerId>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(market: MarketHandle, registry: ProcessorRegistry, slots_per_type: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(registry);

        let mut workers = Vec::new();
        let mut joins = Vec::new();
        for job_type in registry.types() {
            for _ in 0..slots_per_type {
                let worker = WorkerId::generate();
                let slot = Slot {
                    worker,
                    job_type: job_type.clone(),
                    market: market.clone(),
                    registry: Arc::clone(&registry),
                };
                let rx = shutdown_rx.clone();
                joins.push(tokio::spawn(slot.run(rx)));
                workers.push(worker);
            }
        }
        info!(slots = workers.len(), "worker group started");

        Self {
            shutdown_tx,
            workers,
            joins,
        }
    }

    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    /// Stop taking new jobs. Running job bodies are not interrupted.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

struct Slot {
    worker: WorkerId,
    job_type: JobType,
    market: MarketHandle,
    registry: Arc<ProcessorRegistry>,
}

impl Slot {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut inbox = match self
                .market
                .worker_idle(self.job_type.clone(), self.worker)
                .await
            {
                Ok(inbox) => inbox,
                Err(e) => {
                    debug!(worker_id = %self.worker, error = %e, "market closed");
                    break;
                }
            };

            let assignment = tokio::select! {
                assignment = &mut inbox => assignment.ok(),
                _ = shutdown_rx.changed() => {
                    // An assignment may have landed just before we closed.
                    inbox.close();
                    inbox.try_recv().ok()
                }
            };
            let Some(assignment) = assignment else {
                break;
            };

            let outcome = self.execute(assignment).await;
            if let Err(e) = self.market.report_result(outcome).await {
                warn!(worker_id = %self.worker, error = %e, "could not report result");
                break;
            }
        }
        debug!(worker_id = %self.worker, job_type = %self.job_type, "worker slot stopped");
    }

    async fn execute(&self, assignment: Assignment) -> JobOutcome {
        let Assignment {
            id,
            job_type,
            payload,
            cancel,
        } = assignment;

        let Some(processor) = self.registry.get(&job_type).cloned() else {
            return JobOutcome::failed(id, job_type.clone(), format!("no processor for {job_type}"));
        };

        let market = self.market.clone();
        let reporter = ProgressReporter::new(id.clone(), move |id, progress| {
            let _ = market.report_progress_blocking(id.clone(), progress);
        });
        let ctx = JobContext::new(id.clone(), job_type.clone(), payload, reporter, cancel);

        debug!(worker_id = %self.worker, job_id = %id, "running job");
        tokio::task::spawn_blocking(move || execute(processor.as_ref(), &ctx))
            .await
            .unwrap_or_else(|e| JobOutcome::failed(id, job_type, format!("worker task failed: {e}")))
    }
}
