//! Typed job API.
//!
//! Two layers:
//! - surface: `Job` (type name bound to a payload struct) and `Handler<T>`
//! - erased: `TypedProcessor<T, H>` implements `Processor`, so typed handlers
//!   live in the same `ProcessorRegistry` as closures

pub mod handler;
pub mod job;

pub use self::handler::{Handler, TypedProcessor};
pub use self::job::Job;
