//! Market clients: producers submit jobs, worker groups execute them.

mod producer;
mod worker;

pub use self::producer::{Producer, SubmittedJob};
pub use self::worker::WorkerGroup;
