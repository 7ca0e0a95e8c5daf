//! shuttle-core
//!
//! Dependency-driven job scheduling.
//!
//! # Modules
//! - **domain**: ids, job records, progress, outcomes, events
//! - **ledger**: dependency graph with two-phase declare/finalize
//! - **manager**: actor that owns the ledger and dispatches ready jobs
//! - **market**: per-type matching of submitted jobs and idle workers
//! - **client**: market producers and worker groups
//! - **registry** / **typed**: processors by job type, untyped and typed
//! - **ports** / **impls**: graph storage seam and its in-memory backend
//! - **config**: TOML config with environment overrides

pub mod client;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ledger;
pub mod manager;
pub mod market;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod typed;

pub use client::{Producer, SubmittedJob, WorkerGroup};
pub use config::{DispatchMode, ShuttleConfig};
pub use context::{CancelFlag, JobContext};
pub use domain::{JobEvent, JobId, JobOutcome, JobState, JobType, NewJob, Outcome, ProgressState};
pub use error::ShuttleError;
pub use ledger::{DependencyLedger, FailurePolicy};
pub use manager::{ManagerBuilder, ManagerHandle};
pub use market::{JobMarket, MarketHandle};
pub use registry::{Processor, ProcessorRegistry, processor_fn};
