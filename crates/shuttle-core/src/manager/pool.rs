//! Bounded in-process worker pool.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::Internal;
use crate::context::JobContext;
use crate::domain::JobOutcome;
use crate::registry::{Processor, execute};

pub(super) struct LocalJob {
    pub ctx: JobContext,
    pub processor: Arc<dyn Processor>,
}

/// `slots` tasks pulling from one queue; each job body runs on the blocking pool.
///
/// The queue holds at most `slots` jobs and the manager never has more than
/// `slots` in flight, so `try_dispatch` only fails once the pool is gone.
pub(super) struct LocalPool {
    tx: mpsc::Sender<LocalJob>,
    slots: usize,
    in_flight: usize,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl LocalPool {
    pub fn spawn(slots: usize, internal: mpsc::UnboundedSender<Internal>) -> Self {
        let (tx, rx) = mpsc::channel(slots);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..slots)
            .map(|slot| {
                let rx = Arc::clone(&rx);
                let internal = internal.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(slot_loop(slot, rx, internal, shutdown_rx))
            })
            .collect();

        Self {
            tx,
            slots,
            in_flight: 0,
            shutdown_tx,
            joins,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.slots
    }

    /// Hands the job back if the pool cannot take it.
    pub fn try_dispatch(&mut self, job: LocalJob) -> Result<(), LocalJob> {
        if !self.has_capacity() {
            return Err(job);
        }
        self.tx.try_send(job).map_err(|e| e.into_inner())?;
        self.in_flight += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Stop the slots and wait for the bodies they are running.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn slot_loop(
    slot: usize,
    rx: Arc<Mutex<mpsc::Receiver<LocalJob>>>,
    internal: mpsc::UnboundedSender<Internal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // recv() is cancel safe, so losing the race to shutdown drops nothing.
        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(LocalJob { ctx, processor }) = job else {
            break;
        };

        let id = ctx.id().clone();
        let job_type = ctx.job_type().clone();
        debug!(slot, job_id = %id, "slot picked up job");
        if internal.send(Internal::Started(id.clone())).is_err() {
            break;
        }

        let outcome = tokio::task::spawn_blocking(move || execute(processor.as_ref(), &ctx))
            .await
            .unwrap_or_else(|e| {
                JobOutcome::failed(id, job_type, format!("worker task failed: {e}"))
            });
        if internal.send(Internal::Finished(outcome)).is_err() {
            break;
        }
    }
    debug!(slot, "pool slot stopped");
}
