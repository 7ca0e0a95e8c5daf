//! Impls - in-process implementations of the ports.
//!
//! Production backends (embedded graph DBs, remote KV stores) live in their
//! own crates and implement the same traits.

pub mod memory_store;

pub use self::memory_store::InMemoryGraphStore;
