//! Write-through mirror from the ledger into an optional `GraphStore`.
//!
//! The in-memory ledger stays authoritative: a failing backend is logged and
//! the scheduler keeps going.

use tracing::warn;

use crate::domain::{JobId, JobState, JobType};
use crate::ports::{GraphStore, REQUIRES, StoreError};

#[derive(Default)]
pub(super) struct StoreMirror {
    store: Option<Box<dyn GraphStore>>,
    dirty: bool,
}

impl StoreMirror {
    pub fn new(store: Option<Box<dyn GraphStore>>) -> Self {
        Self {
            store,
            dirty: false,
        }
    }

    fn apply(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut dyn GraphStore) -> Result<(), StoreError>,
    ) {
        let Some(store) = self.store.as_deref_mut() else {
            return;
        };
        if let Err(e) = f(store) {
            warn!(op, error = %e, "graph store write failed");
        }
        self.dirty = true;
    }

    pub fn vertex(&mut self, id: &JobId) {
        self.apply("add_vertex", |s| s.add_vertex(id));
    }

    pub fn edge(&mut self, from: &JobId, to: &JobId) {
        self.apply("add_edge", |s| s.add_edge(from, to, REQUIRES));
    }

    pub fn state(&mut self, id: &JobId, job_type: &JobType, state: JobState) {
        self.apply("set_properties", |s| s.set_properties(id, job_type, state));
    }

    pub fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        if let Some(store) = self.store.as_deref_mut()
            && let Err(e) = store.commit()
        {
            warn!(error = %e, "graph store commit failed");
        }
    }
}
