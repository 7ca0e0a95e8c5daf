//! Dependent job manager: declare jobs with dependencies, run them when ready.
//!
//! ```ignore
//! let manager = ManagerBuilder::new()
//!     .worker_threads(4)
//!     .processor("split", processor_fn(|ctx| Ok(true)))?
//!     .build()?;
//!
//! manager.add_job(NewJob::new("s1", "split", json!({}))).await?;
//! manager.add_job(NewJob::new("join", "merge", json!({})).join()).await?;
//! manager.add_dependent_jobs("join", ["s1"]).await?;
//! manager.finalize("join").await?;
//! ```

mod actor;
mod dispatch;
mod pool;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use self::actor::{Command, ManagerActor};
pub(crate) use self::actor::Internal;
use self::dispatch::Dispatcher;
use crate::config::{DispatchMode, SchedulerConfig, ShuttleConfig};
use crate::domain::{JobEvent, JobId, JobState, JobType, NewJob, ProgressState};
use crate::error::ShuttleError;
use crate::ledger::{DependencyLedger, FailurePolicy};
use crate::market::MarketHandle;
use crate::observability::LedgerCounts;
use crate::ports::GraphStore;
use crate::registry::{Processor, ProcessorRegistry};
use crate::typed::{Handler, Job};

/// Cloneable handle to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<JobEvent>,
    join: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ManagerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ShuttleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ShuttleError::Closed("job manager"))?;
        rx.await.map_err(|_| ShuttleError::Closed("job manager"))
    }

    /// Declare a job. Ordinary jobs are finalized immediately; join jobs stay
    /// open until `finalize`. Returns the state right after declaration.
    pub async fn add_job(&self, job: NewJob) -> Result<JobState, ShuttleError> {
        self.request(|reply| Command::AddJob { job, reply }).await?
    }

    /// Attach more dependencies to an open (join) job.
    pub async fn add_dependent_jobs<I, T>(
        &self,
        id: impl Into<JobId>,
        deps: I,
    ) -> Result<(), ShuttleError>
    where
        I: IntoIterator<Item = T>,
        T: Into<JobId>,
    {
        let id = id.into();
        let deps = deps.into_iter().map(Into::into).collect();
        self.request(|reply| Command::AddDependencies { id, deps, reply })
            .await?
    }

    /// Close dependency declaration. Finalizing twice is a no-op.
    pub async fn finalize(&self, id: impl Into<JobId>) -> Result<(), ShuttleError> {
        self.finalize_all([id.into()]).await
    }

    /// Finalize every id; the first error is returned after all were tried.
    pub async fn finalize_all<I, T>(&self, ids: I) -> Result<(), ShuttleError>
    where
        I: IntoIterator<Item = T>,
        T: Into<JobId>,
    {
        let ids = ids.into_iter().map(Into::into).collect();
        self.request(|reply| Command::Finalize { ids, reply })
            .await?
    }

    pub async fn register_processor(
        &self,
        job_type: impl Into<JobType>,
        processor: Arc<dyn Processor>,
    ) -> Result<(), ShuttleError> {
        let job_type = job_type.into();
        self.request(|reply| Command::RegisterProcessor {
            job_type,
            processor,
            reply,
        })
        .await?
    }

    /// `Ok(false)` if the job already finished.
    pub async fn cancel_job(&self, id: impl Into<JobId>) -> Result<bool, ShuttleError> {
        let id = id.into();
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn status(&self, id: impl Into<JobId>) -> Result<Option<JobState>, ShuttleError> {
        let id = id.into();
        self.request(|reply| Command::Status { id, reply }).await
    }

    pub async fn progress(
        &self,
        id: impl Into<JobId>,
    ) -> Result<Option<ProgressState>, ShuttleError> {
        let id = id.into();
        self.request(|reply| Command::Progress { id, reply }).await
    }

    pub async fn dependencies(&self, id: impl Into<JobId>) -> Result<Vec<JobId>, ShuttleError> {
        let id = id.into();
        self.request(|reply| Command::Dependencies { id, reply })
            .await
    }

    pub async fn counts(&self) -> Result<LedgerCounts, ShuttleError> {
        self.request(|reply| Command::Counts { reply }).await
    }

    /// Events from now on. A receiver that falls behind gets `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop the actor and the local pool, then wait for them.
    ///
    /// The cancel flag of every in-flight job is raised, and the call waits
    /// for running bodies to return. A body that never checks its flag runs
    /// to the end. Results that arrive after shutdown are dropped.
    pub async fn shutdown(&self) -> Result<(), ShuttleError> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        let join = self
            .join
            .lock()
            .map_err(|_| ShuttleError::Closed("job manager"))?
            .take();
        if let Some(join) = join {
            let _ = join.await;
        }
        Ok(())
    }
}

/// Wires a manager together and fails fast on bad setup.
pub struct ManagerBuilder {
    config: SchedulerConfig,
    registry: ProcessorRegistry,
    store: Option<Box<dyn GraphStore>>,
    market: Option<MarketHandle>,
    expected: Vec<JobType>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::from_config(SchedulerConfig::default())
    }

    pub fn from_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            registry: ProcessorRegistry::new(),
            store: None,
            market: None,
            expected: Vec::new(),
        }
    }

    pub fn from_shuttle_config(config: &ShuttleConfig) -> Self {
        Self::from_config(config.scheduler.clone())
    }

    /// Local pool size (and in-flight cap in local mode).
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn strict_dependencies(mut self, strict: bool) -> Self {
        self.config.strict_dependencies = strict;
        self
    }

    pub fn progress_retention(mut self, retention: usize) -> Self {
        self.config.progress_retention = retention;
        self
    }

    pub fn reject_cycles(mut self, reject: bool) -> Self {
        self.config.reject_cycles = reject;
        self
    }

    pub fn graph_store(mut self, store: impl GraphStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Dispatch through `market` instead of the local pool.
    pub fn market(mut self, market: MarketHandle) -> Self {
        self.config.dispatch = DispatchMode::Market;
        self.market = Some(market);
        self
    }

    pub fn processor(
        mut self,
        job_type: impl Into<JobType>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self, ShuttleError> {
        self.registry.register(job_type.into(), processor)?;
        Ok(self)
    }

    pub fn typed<T, H>(mut self, handler: H) -> Result<Self, ShuttleError>
    where
        T: Job,
        H: Handler<T> + 'static,
    {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// `build()` fails unless every listed type has a processor.
    pub fn expect_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<JobType>,
    {
        self.expected = types.into_iter().map(Into::into).collect();
        self
    }

    /// Spawn the manager actor. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<ManagerHandle, ShuttleError> {
        let missing: Vec<JobType> = self
            .expected
            .iter()
            .filter(|t| !self.registry.contains(t))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ShuttleError::MissingProcessors(missing));
        }

        let config = self.config;
        ShuttleConfig {
            scheduler: config.clone(),
            ..ShuttleConfig::default()
        }
        .validate()?;

        let mut ledger = DependencyLedger::new(config.ledger_options());
        if let Some(store) = self.store {
            ledger = ledger.with_store(store);
        }

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let dispatcher = match (config.dispatch, self.market) {
            (DispatchMode::Local, _) => Dispatcher::local(config.worker_threads, internal_tx.clone()),
            (DispatchMode::Market, Some(market)) => {
                Dispatcher::market(market, internal_tx.clone())?
            }
            (DispatchMode::Market, None) => {
                return Err(ShuttleError::Config(
                    "dispatch = market needs a market handle".to_string(),
                ));
            }
        };

        let (tx, rx) = mpsc::channel(config.command_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let actor = ManagerActor::new(
            ledger,
            self.registry,
            dispatcher,
            events.clone(),
            internal_tx,
            config.progress_retention,
        );
        let join = tokio::spawn(actor.run(rx, internal_rx));
        info!(
            dispatch = ?config.dispatch,
            worker_threads = config.worker_threads,
            failure_policy = ?config.failure_policy,
            "job manager started"
        );

        Ok(ManagerHandle {
            tx,
            events,
            join: Arc::new(std::sync::Mutex::new(Some(join))),
        })
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
