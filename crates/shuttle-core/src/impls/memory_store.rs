//! InMemoryGraphStore - development/test GraphStore.
//!
//! Writes are staged and become visible on `commit`, which mirrors how a
//! transactional graph backend behaves. Clones share the same storage, so a
//! test can keep a handle while the ledger owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{JobId, JobState, JobType};
use crate::ports::{GraphStore, StoreError, Vertex};

#[derive(Debug, Default)]
struct Snapshot {
    vertices: BTreeMap<JobId, Vertex>,
    edges: BTreeSet<(JobId, JobId, String)>,
}

#[derive(Debug)]
enum Op {
    Vertex(JobId),
    Edge(JobId, JobId, String),
    Properties(JobId, JobType, JobState),
}

#[derive(Debug, Default)]
struct Inner {
    committed: Snapshot,
    staged: Vec<Op>,
    commits: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryGraphStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("store lock poisoned: {e}")))
    }

    /// Committed dependency edges `(from, to)` with the given label.
    pub fn edges(&self, label: &str) -> Vec<(JobId, JobId)> {
        let Ok(inner) = self.lock() else {
            return Vec::new();
        };
        inner
            .committed
            .edges
            .iter()
            .filter(|(_, _, l)| l == label)
            .map(|(from, to, _)| (from.clone(), to.clone()))
            .collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.lock().map(|i| i.committed.vertices.len()).unwrap_or(0)
    }

    pub fn commit_count(&self) -> u64 {
        self.lock().map(|i| i.commits).unwrap_or(0)
    }
}

impl GraphStore for InMemoryGraphStore {
    fn add_vertex(&mut self, id: &JobId) -> Result<(), StoreError> {
        self.lock()?.staged.push(Op::Vertex(id.clone()));
        Ok(())
    }

    fn add_edge(&mut self, from: &JobId, to: &JobId, label: &str) -> Result<(), StoreError> {
        self.lock()?
            .staged
            .push(Op::Edge(from.clone(), to.clone(), label.to_string()));
        Ok(())
    }

    fn get_vertex(&self, id: &JobId) -> Option<Vertex> {
        self.lock().ok()?.committed.vertices.get(id).cloned()
    }

    fn set_properties(
        &mut self,
        id: &JobId,
        job_type: &JobType,
        state: JobState,
    ) -> Result<(), StoreError> {
        self.lock()?
            .staged
            .push(Op::Properties(id.clone(), job_type.clone(), state));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let staged = std::mem::take(&mut inner.staged);
        for op in staged {
            match op {
                Op::Vertex(id) => {
                    inner
                        .committed
                        .vertices
                        .entry(id.clone())
                        .or_insert(Vertex {
                            id,
                            job_type: None,
                            state: None,
                        });
                }
                Op::Edge(from, to, label) => {
                    for id in [&from, &to] {
                        if !inner.committed.vertices.contains_key(id) {
                            return Err(StoreError::MissingVertex(id.clone()));
                        }
                    }
                    inner.committed.edges.insert((from, to, label));
                }
                Op::Properties(id, job_type, state) => {
                    let vertex = inner
                        .committed
                        .vertices
                        .get_mut(&id)
                        .ok_or_else(|| StoreError::MissingVertex(id.clone()))?;
                    vertex.job_type = Some(job_type);
                    vertex.state = Some(state);
                }
            }
        }
        inner.commits += 1;
        Ok(())
    }
}
