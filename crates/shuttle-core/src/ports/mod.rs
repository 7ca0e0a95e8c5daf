//! Ports - seams to external collaborators.
//!
//! Only the storage backend lives outside the scheduler today; transports are
//! modelled in-process with tokio channels.

pub mod graph_store;

pub use self::graph_store::{GraphStore, REQUIRES, StoreError, Vertex};
