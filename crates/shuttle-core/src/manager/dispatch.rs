//! Where the manager sends ready jobs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::Internal;
use super::pool::{LocalJob, LocalPool};
use crate::client::Producer;
use crate::context::{CancelFlag, JobContext, ProgressReporter};
use crate::domain::{JobId, JobType, Payload};
use crate::error::ShuttleError;
use crate::market::MarketHandle;
use crate::registry::Processor;

/// One ready job, already marked dispatched in the ledger.
pub(super) struct Dispatch {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: Arc<Payload>,
    pub cancel: CancelFlag,
    pub processor: Arc<dyn Processor>,
}

pub(super) enum Dispatcher {
    Local(LocalPool),
    Market(MarketDispatcher),
}

impl Dispatcher {
    pub fn local(slots: usize, internal: mpsc::UnboundedSender<Internal>) -> Self {
        Dispatcher::Local(LocalPool::spawn(slots, internal))
    }

    pub fn market(
        market: MarketHandle,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Result<Self, ShuttleError> {
        Ok(Dispatcher::Market(MarketDispatcher::new(market, internal)?))
    }

    pub fn has_capacity(&self) -> bool {
        match self {
            Dispatcher::Local(pool) => pool.has_capacity(),
            Dispatcher::Market(_) => true,
        }
    }

    pub async fn dispatch(
        &mut self,
        job: Dispatch,
        internal: &mpsc::UnboundedSender<Internal>,
    ) -> Result<(), ShuttleError> {
        match self {
            Dispatcher::Local(pool) => {
                let progress = internal.clone();
                let reporter = ProgressReporter::new(job.id.clone(), move |id, progress_state| {
                    let _ = progress.send(Internal::Progress {
                        id: id.clone(),
                        progress: progress_state,
                    });
                });
                let ctx = JobContext::new(job.id, job.job_type, job.payload, reporter, job.cancel);
                pool.try_dispatch(LocalJob {
                    ctx,
                    processor: job.processor,
                })
                .map_err(|_| ShuttleError::Closed("local pool"))
            }
            Dispatcher::Market(market) => {
                market
                    .producer
                    .add_job_shared(job.id, job.job_type, job.payload)
                    .await
            }
        }
    }

    /// A dispatched job reported back.
    pub fn release(&mut self) {
        if let Dispatcher::Local(pool) = self {
            pool.release();
        }
    }

    /// Forward a cancel request for an in-flight job.
    pub async fn cancel(&self, id: &JobId) {
        if let Dispatcher::Market(market) = self
            && let Err(e) = market.producer.market().cancel(id.clone()).await
        {
            warn!(job_id = %id, error = %e, "market cancel failed");
        }
    }

    pub fn in_flight(&self) -> Option<usize> {
        match self {
            Dispatcher::Local(pool) => Some(pool.in_flight()),
            Dispatcher::Market(_) => None,
        }
    }

    pub async fn shutdown(self) {
        if let Dispatcher::Local(pool) = self {
            pool.shutdown().await;
        }
    }
}

/// Submits through a `Producer`; results come back through its handlers.
pub(super) struct MarketDispatcher {
    producer: Producer,
}

impl MarketDispatcher {
    fn new(
        market: MarketHandle,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> Result<Self, ShuttleError> {
        let producer = Producer::new(market);

        let finished = internal.clone();
        producer.add_job_completion_handler(move |outcome| {
            let _ = finished.send(Internal::Finished(outcome.clone()));
        })?;
        producer.add_progress_handler(move |id, progress| {
            let _ = internal.send(Internal::Progress {
                id: id.clone(),
                progress: progress.clone(),
            });
        })?;

        Ok(Self { producer })
    }
}
