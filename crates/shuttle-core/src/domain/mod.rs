//! Domain model (ids, job records, progress, outcomes, events).

pub mod events;
pub mod ids;
pub mod job;
pub mod job_type;
pub mod outcome;
pub mod progress;
pub mod spec;

pub use events::{JobEvent, JobOutcome};
pub use ids::{Id, IdMarker, JobId, ProducerId, WorkerId};
pub use job::{JobRecord, JobState, Payload};
pub use job_type::JobType;
pub use outcome::{Outcome, OutcomeKind};
pub use progress::{DEFAULT_PROGRESS_RETENTION, ProgressBook, ProgressState};
pub use spec::NewJob;
