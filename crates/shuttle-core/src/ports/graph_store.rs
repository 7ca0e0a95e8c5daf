//! GraphStore port - persistence seam for the dependency ledger.
//!
//! The ledger keeps its own in-memory adjacency structure and is the source
//! of truth while the scheduler runs. A `GraphStore` only mirrors writes so
//! an embedded or remote graph/key-value backend can keep a durable copy.

use thiserror::Error;

use crate::domain::{JobId, JobState, JobType};

/// Edge label used for dependency edges (`dependent -[requires]-> dependency`).
pub const REQUIRES: &str = "requires";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vertex {0} not found")]
    MissingVertex(JobId),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// A stored vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vertex {
    pub id: JobId,
    pub job_type: Option<JobType>,
    pub state: Option<JobState>,
}

/// Minimal vertex/edge contract any backend can satisfy.
///
/// Calls are synchronous: the ledger runs inside a single actor and a
/// backend that needs I/O is expected to buffer until `commit`.
pub trait GraphStore: Send {
    fn add_vertex(&mut self, id: &JobId) -> Result<(), StoreError>;

    fn add_edge(&mut self, from: &JobId, to: &JobId, label: &str) -> Result<(), StoreError>;

    fn get_vertex(&self, id: &JobId) -> Option<Vertex>;

    /// Record vertex properties. Backends that only store topology may ignore this.
    fn set_properties(
        &mut self,
        _id: &JobId,
        _job_type: &JobType,
        _state: JobState,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError>;
}
