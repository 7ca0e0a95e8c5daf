//! Input spec for declaring a job.

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::job::Payload;
use super::job_type::JobType;

/// A job declaration, as passed to `ManagerHandle::add_job`.
///
/// Ordinary jobs are finalized at declaration. A join job (`join()`) stays
/// open so predecessors discovered later can be attached with
/// `add_dependent_jobs`; it only becomes eligible after `finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub job_type: JobType,

    #[serde(default)]
    pub payload: Payload,

    /// Known dependencies at declaration time.
    #[serde(default)]
    pub depends_on: Vec<JobId>,

    /// Leave the job open for more edges.
    #[serde(default)]
    pub join: bool,
}

impl NewJob {
    pub fn new(id: impl Into<JobId>, job_type: impl Into<JobType>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload,
            depends_on: Vec::new(),
            join: false,
        }
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<JobId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn join(mut self) -> Self {
        self.join = true;
        self
    }
}
