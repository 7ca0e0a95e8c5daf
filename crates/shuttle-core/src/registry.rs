use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::context::JobContext;
use crate::domain::{JobId, JobOutcome, JobType, Outcome, Payload};
use crate::error::ShuttleError;
use crate::typed::{Handler, Job, TypedProcessor};

/// Executes jobs of one type.
///
/// `run` is synchronous and may block: it is always called on the blocking
/// thread pool, never on an async worker thread.
pub trait Processor: Send + Sync {
    fn run(&self, ctx: &JobContext) -> Result<Outcome, ShuttleError>;

    /// Cheap go/no-go check before dispatch. `false` fails the job unrun.
    fn precheck(&self, _id: &JobId, _payload: &Payload) -> bool {
        true
    }

    /// Cancellation hook for a dispatched job. Called at most once per job.
    ///
    /// Returns `true` if the processor acknowledged the request. The job's
    /// cancel flag is raised either way.
    fn cancel(&self, _id: &JobId) -> bool {
        false
    }
}

struct FnProcessor<F, O> {
    f: F,
    _out: PhantomData<fn() -> O>,
}

impl<F, O> Processor for FnProcessor<F, O>
where
    F: Fn(&JobContext) -> Result<O, ShuttleError> + Send + Sync,
    O: Into<Outcome>,
{
    fn run(&self, ctx: &JobContext) -> Result<Outcome, ShuttleError> {
        (self.f)(ctx).map(Into::into)
    }
}

/// Wrap a closure as a processor. The closure may return `Outcome` or `bool`.
pub fn processor_fn<F, O>(f: F) -> Arc<dyn Processor>
where
    F: Fn(&JobContext) -> Result<O, ShuttleError> + Send + Sync + 'static,
    O: Into<Outcome> + 'static,
{
    Arc::new(FnProcessor {
        f,
        _out: PhantomData,
    })
}

/// Registry of processors (job_type -> processor).
///
/// Owned by one actor or worker group; no locking.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a job type. Registering a type twice is an error.
    pub fn register(
        &mut self,
        job_type: JobType,
        processor: Arc<dyn Processor>,
    ) -> Result<(), ShuttleError> {
        if self.processors.contains_key(&job_type) {
            return Err(ShuttleError::DuplicateProcessor(job_type));
        }
        self.processors.insert(job_type, processor);
        Ok(())
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register_typed<T, H>(&mut self, handler: H) -> Result<(), ShuttleError>
    where
        T: Job,
        H: Handler<T> + 'static,
    {
        self.register(
            JobType::new(T::TYPE),
            Arc::new(TypedProcessor::<T, H>::new(handler)),
        )
    }

    pub fn get(&self, job_type: &JobType) -> Option<&Arc<dyn Processor>> {
        self.processors.get(job_type)
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.processors.contains_key(job_type)
    }

    pub fn types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Run one job body to a completion message.
///
/// Errors, `false` returns and panics all become failed completions. A body
/// that gives up after its cancel flag was raised ends `Cancelled`.
pub fn execute(processor: &dyn Processor, ctx: &JobContext) -> JobOutcome {
    let id = ctx.id().clone();
    let job_type = ctx.job_type().clone();

    let result = catch_unwind(AssertUnwindSafe(|| processor.run(ctx)));
    match result {
        Ok(Ok(outcome)) if !outcome.is_success() && ctx.is_cancelled() => {
            JobOutcome::cancelled(id, job_type)
        }
        Ok(Ok(outcome)) => JobOutcome::from_outcome(id, job_type, outcome),
        Ok(Err(ShuttleError::CancellationSignalled(_))) => JobOutcome::cancelled(id, job_type),
        Ok(Err(e)) => JobOutcome::failed(id, job_type, e.to_string()),
        Err(panic) => {
            let reason = format!("processor panicked: {}", panic_message(panic.as_ref()));
            JobOutcome::failed(id, job_type, reason)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
