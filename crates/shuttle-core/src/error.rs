use thiserror::Error;

use crate::domain::{JobId, JobState, JobType};

#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error("job {0} is already declared")]
    DuplicateJob(JobId),

    #[error("job {job} depends on undeclared job {dependency}")]
    UnknownDependency { job: JobId, dependency: JobId },

    #[error("job {0} is already finalized; no more dependencies can be added")]
    AlreadyFinalized(JobId),

    #[error("no processor registered for job_type={0}")]
    UnregisteredType(JobType),

    #[error("duplicate processor for job_type={0}")]
    DuplicateProcessor(JobType),

    #[error("expected processors are not registered: {0:?}")]
    MissingProcessors(Vec<JobType>),

    #[error("job {id} failed: {reason}")]
    Execution { id: JobId, reason: String },

    #[error("job {0} observed a cancellation request")]
    CancellationSignalled(JobId),

    #[error("job {0} rejected by precheck")]
    PrecheckFailed(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<JobId>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} has shut down")]
    Closed(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl ShuttleError {
    pub fn execution(id: &JobId, reason: impl Into<String>) -> Self {
        Self::Execution {
            id: id.clone(),
            reason: reason.into(),
        }
    }
}

fn format_cycle(cycle: &[JobId]) -> String {
    cycle
        .iter()
        .map(JobId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
