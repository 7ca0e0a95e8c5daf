use std::marker::PhantomData;

use super::job::Job;
use crate::context::JobContext;
use crate::domain::{JobId, Outcome, Payload};
use crate::error::ShuttleError;
use crate::registry::Processor;

/// Runs a decoded `T`.
///
/// `Handler<Split>` only ever sees `Split` payloads; the pairing is checked
/// at compile time by `ProcessorRegistry::register_typed`.
pub trait Handler<T: Job>: Send + Sync {
    fn handle(&self, job: T, ctx: &JobContext) -> Result<Outcome, ShuttleError>;

    fn precheck(&self, _id: &JobId, _job: &T) -> bool {
        true
    }

    /// `true` if the handler acted on the request.
    fn cancel(&self, _id: &JobId) -> bool {
        false
    }
}

/// Erases `Handler<T>` into a `Processor`.
pub struct TypedProcessor<T: Job, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Job, H: Handler<T>> TypedProcessor<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<T: Job, H: Handler<T>> Processor for TypedProcessor<T, H> {
    fn run(&self, ctx: &JobContext) -> Result<Outcome, ShuttleError> {
        let job: T = ctx.decode()?;
        self.handler.handle(job, ctx)
    }

    /// A payload that does not decode fails precheck.
    fn precheck(&self, id: &JobId, payload: &Payload) -> bool {
        match T::deserialize(payload) {
            Ok(job) => self.handler.precheck(id, &job),
            Err(_) => false,
        }
    }

    fn cancel(&self, id: &JobId) -> bool {
        self.handler.cancel(id)
    }
}
