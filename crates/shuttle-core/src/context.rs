//! What a processor sees while running one job.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;

use crate::domain::{JobId, JobType, Payload, ProgressState};
use crate::error::ShuttleError;

/// Shared cancellation signal for one job.
///
/// Raised by the manager or the market; polled by the job body.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type SendFn = dyn Fn(&JobId, ProgressState) + Send + Sync;

/// Sends progress for one job back to whoever dispatched it.
#[derive(Clone)]
pub struct ProgressReporter {
    id: JobId,
    send: Option<Arc<SendFn>>,
}

impl ProgressReporter {
    pub fn new<F>(id: JobId, send: F) -> Self
    where
        F: Fn(&JobId, ProgressState) + Send + Sync + 'static,
    {
        Self {
            id,
            send: Some(Arc::new(send)),
        }
    }

    /// Reporter that drops everything. Handy in tests.
    pub fn noop(id: JobId) -> Self {
        Self { id, send: None }
    }

    pub fn send(&self, state: ProgressState) {
        if let Some(send) = &self.send {
            send(&self.id, state);
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("id", &self.id)
            .field("connected", &self.send.is_some())
            .finish()
    }
}

/// Immutable snapshot of a job handed to `Processor::run`.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    job_type: JobType,
    payload: Arc<Payload>,
    progress: ProgressReporter,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn new(
        id: JobId,
        job_type: JobType,
        payload: Arc<Payload>,
        progress: ProgressReporter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            id,
            job_type,
            payload,
            progress,
            cancel,
        }
    }

    /// Context with no progress sink and a fresh cancel flag.
    pub fn detached(id: impl Into<JobId>, job_type: impl Into<JobType>, payload: Payload) -> Self {
        let id = id.into();
        Self::new(
            id.clone(),
            job_type.into(),
            Arc::new(payload),
            ProgressReporter::noop(id),
            CancelFlag::new(),
        )
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Deserialize the payload into a typed job.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ShuttleError> {
        T::deserialize(self.payload.as_ref())
            .map_err(|e| ShuttleError::execution(&self.id, format!("json decode: {e}")))
    }

    pub fn send_progress(&self, state: ProgressState) {
        self.progress.send(state);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_raised()
    }

    /// `Err(CancellationSignalled)` once cancellation was requested.
    ///
    /// Meant for `?` at safe points inside long job bodies.
    pub fn check_cancelled(&self) -> Result<(), ShuttleError> {
        if self.is_cancelled() {
            return Err(ShuttleError::CancellationSignalled(self.id.clone()));
        }
        Ok(())
    }
}
