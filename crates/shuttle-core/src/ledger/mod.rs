//! Dependency ledger: job nodes plus directed "requires" edges.
//!
//! Design:
//! - Arena of nodes (`Vec<Option<Node>>` + free list), addressed by index.
//! - `index`: JobId -> slot, for live jobs and forward-declared placeholders.
//! - `retired`: JobId -> terminal state, for jobs whose slot was freed.
//! - A node is retired as soon as it reaches a terminal state and every
//!   current dependent has been updated; later edges pointing at it are
//!   resolved from `retired`.
//!
//! The ledger is not thread-safe on purpose: it is owned by the manager actor,
//! which is the only writer.

mod cycle;
mod mirror;
mod node;

use std::collections::HashMap;

use tracing::debug;

pub use self::node::{Cascaded, Effects, FailurePolicy, Promoted};
use self::mirror::StoreMirror;
use self::node::Node;
use crate::domain::{JobId, JobRecord, JobState, JobType, Payload};
use crate::error::ShuttleError;
use crate::observability::LedgerCounts;
use crate::ports::GraphStore;

/// Behaviour switches for a ledger instance.
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    pub failure_policy: FailurePolicy,

    /// Reject edges to ids that were never declared.
    pub strict_dependencies: bool,

    /// Reject edges that would close a dependency cycle.
    pub reject_cycles: bool,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            strict_dependencies: false,
            reject_cycles: true,
        }
    }
}

pub struct DependencyLedger {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<JobId, usize>,
    retired: HashMap<JobId, JobState>,
    options: LedgerOptions,
    mirror: StoreMirror,
}

impl DependencyLedger {
    pub fn new(options: LedgerOptions) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            retired: HashMap::new(),
            options,
            mirror: StoreMirror::default(),
        }
    }

    /// Mirror every write into `store`.
    pub fn with_store(mut self, store: Box<dyn GraphStore>) -> Self {
        self.mirror = StoreMirror::new(Some(store));
        self
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    // ── declaration ─────────────────────────────────────────────────

    /// Declare a job (not finalized) with its initially known dependencies.
    pub fn declare(
        &mut self,
        id: JobId,
        job_type: JobType,
        payload: Payload,
        deps: &[JobId],
    ) -> Result<&JobRecord, ShuttleError> {
        if self.retired.contains_key(&id) {
            return Err(ShuttleError::DuplicateJob(id));
        }
        let existing = self.index.get(&id).copied();
        if let Some(idx) = existing
            && !self.node(idx).is_placeholder()
        {
            return Err(ShuttleError::DuplicateJob(id));
        }
        self.validate_deps(&id, existing, deps)?;

        let idx = match existing {
            Some(idx) => idx,
            None => {
                self.mirror.vertex(&id);
                self.allocate(Node::placeholder(id.clone()))
            }
        };
        let record = JobRecord::new(id.clone(), job_type, payload);
        self.mirror.state(&id, &record.job_type, record.state);
        self.node_mut(idx).record = Some(record);
        for dep in deps {
            self.link(idx, dep);
        }
        self.mirror.commit();
        debug!(job_id = %id, deps = deps.len(), "job declared");

        Ok(self
            .node(idx)
            .record
            .as_ref()
            .expect("record was just inserted"))
    }

    /// Add dependency edges to a job that is not finalized yet.
    pub fn add_deps(&mut self, id: &JobId, deps: &[JobId]) -> Result<(), ShuttleError> {
        let idx = self.live_index(id)?;
        if self.node(idx).is_finalized() {
            return Err(ShuttleError::AlreadyFinalized(id.clone()));
        }
        self.validate_deps(id, Some(idx), deps)?;
        for dep in deps {
            self.link(idx, dep);
        }
        self.mirror.commit();
        debug!(job_id = %id, added = deps.len(), "dependencies added");
        Ok(())
    }

    /// Mark dependency declaration complete and evaluate readiness.
    ///
    /// Finalizing twice is a no-op: the second call returns empty effects.
    pub fn finalize(&mut self, id: &JobId) -> Result<Effects, ShuttleError> {
        if self.retired.contains_key(id) {
            return Ok(Effects::default());
        }
        let idx = self.live_index(id)?;
        if self.node(idx).is_finalized() {
            return Ok(Effects::default());
        }
        let job_type = {
            let record = self
                .node_mut(idx)
                .record
                .as_mut()
                .expect("live_index skips placeholders");
            record.finalize();
            record.transition(JobState::Waiting);
            record.job_type.clone()
        };

        let mut effects = Effects::default();
        let node = self.node(idx);
        if let Some(blocker) = node.blocked_by.clone() {
            // The job itself is reported alongside its cascade.
            let reason = format!("dependency {blocker} did not complete");
            effects.failed.push(Cascaded {
                id: id.clone(),
                job_type,
                reason: reason.clone(),
            });
            effects.extend(self.fail_node(idx, JobState::Failed, reason));
        } else if node.pending.is_empty() {
            effects.ready.push(self.promote(idx));
        } else {
            self.mirror.state(id, &job_type, JobState::Waiting);
        }
        self.mirror.commit();
        debug!(job_id = %id, ready = effects.ready.len(), "job finalized");
        Ok(effects)
    }

    // ── execution bookkeeping ───────────────────────────────────────

    pub fn mark_dispatched(&mut self, id: &JobId) -> Result<(), ShuttleError> {
        self.advance(id, JobState::Ready, JobState::Dispatched)
    }

    pub fn mark_running(&mut self, id: &JobId) -> Result<(), ShuttleError> {
        self.advance(id, JobState::Dispatched, JobState::Running)
    }

    /// Record a successful completion and promote dependents that became ready.
    ///
    /// Idempotent: completing an already-retired job returns empty effects.
    pub fn mark_completed(&mut self, id: &JobId) -> Result<Effects, ShuttleError> {
        if self.retired.contains_key(id) {
            debug!(job_id = %id, "duplicate completion ignored");
            return Ok(Effects::default());
        }
        let idx = self.live_index(id)?;
        let state = self.node(idx).state().unwrap_or(JobState::Declared);
        if !matches!(
            state,
            JobState::Ready | JobState::Dispatched | JobState::Running
        ) {
            return Err(ShuttleError::InvalidTransition {
                id: id.clone(),
                from: state,
                to: JobState::Completed,
            });
        }

        self.set_state(idx, JobState::Completed);
        let mut effects = Effects::default();
        let dependents: Vec<usize> = self.node(idx).dependents.iter().copied().collect();
        for d in dependents {
            self.node_mut(d).pending.remove(&idx);
            if self.node(d).can_promote() {
                effects.ready.push(self.promote(d));
            }
        }
        self.node_mut(idx).dependents.clear();
        self.retire(idx);
        self.mirror.commit();
        Ok(effects)
    }

    /// Record a failure or cancellation and apply the failure policy to dependents.
    ///
    /// Idempotent like `mark_completed`.
    pub fn mark_failed(
        &mut self,
        id: &JobId,
        terminal: JobState,
        reason: impl Into<String>,
    ) -> Result<Effects, ShuttleError> {
        if self.retired.contains_key(id) {
            return Ok(Effects::default());
        }
        let idx = self.live_index(id)?;
        let terminal = if terminal == JobState::Cancelled {
            JobState::Cancelled
        } else {
            JobState::Failed
        };
        let effects = self.fail_node(idx, terminal, reason.into());
        self.mirror.commit();
        Ok(effects)
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Current state. `None` for unknown ids and forward-declared placeholders.
    pub fn state(&self, id: &JobId) -> Option<JobState> {
        if let Some(state) = self.retired.get(id) {
            return Some(*state);
        }
        self.index.get(id).and_then(|&idx| self.node(idx).state())
    }

    /// Live record (retired jobs only keep their terminal state).
    pub fn record(&self, id: &JobId) -> Option<&JobRecord> {
        self.index
            .get(id)
            .and_then(|&idx| self.node(idx).record.as_ref())
    }

    /// `finalized && remaining == 0` (and not blocked by a failed dependency).
    pub fn is_ready(&self, id: &JobId) -> bool {
        self.index.get(id).is_some_and(|&idx| {
            let node = self.node(idx);
            node.is_finalized() && node.pending.is_empty() && node.blocked_by.is_none()
        })
    }

    /// Jobs still waiting on `id`.
    pub fn dependents_of(&self, id: &JobId) -> Vec<JobId> {
        self.index
            .get(id)
            .map(|&idx| {
                self.node(idx)
                    .dependents
                    .iter()
                    .map(|&d| self.node(d).id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every dependency declared for `id`, resolved or not.
    pub fn dependencies_of(&self, id: &JobId) -> Vec<JobId> {
        self.index
            .get(id)
            .map(|&idx| self.node(idx).deps.clone())
            .unwrap_or_default()
    }

    /// Number of unresolved dependencies.
    pub fn remaining(&self, id: &JobId) -> Option<usize> {
        self.index
            .get(id)
            .map(|&idx| self.node(idx).pending.len())
    }

    pub fn job_type(&self, id: &JobId) -> Option<&JobType> {
        self.record(id).map(|r| &r.job_type)
    }

    /// Number of occupied arena slots (live jobs + placeholders).
    pub fn live_len(&self) -> usize {
        self.index.len()
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for node in self.nodes.iter().flatten() {
            match node.state() {
                None => counts.placeholders += 1,
                Some(state) => counts.add(state),
            }
        }
        for state in self.retired.values() {
            counts.add(*state);
        }
        counts
    }

    // ── internals ───────────────────────────────────────────────────

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx]
            .as_ref()
            .expect("ledger index points at a live slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx]
            .as_mut()
            .expect("ledger index points at a live slot")
    }

    fn live_index(&self, id: &JobId) -> Result<usize, ShuttleError> {
        match self.index.get(id) {
            Some(&idx) if !self.node(idx).is_placeholder() => Ok(idx),
            _ => Err(ShuttleError::UnknownJob(id.clone())),
        }
    }

    fn allocate(&mut self, node: Node) -> usize {
        let id = node.id.clone();
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(id, idx);
        idx
    }

    /// Reject the whole batch before touching anything.
    fn validate_deps(
        &self,
        id: &JobId,
        existing: Option<usize>,
        deps: &[JobId],
    ) -> Result<(), ShuttleError> {
        for dep in deps {
            if dep == id {
                return Err(ShuttleError::DependencyCycle(vec![id.clone(), id.clone()]));
            }
            let target = self.index.get(dep).copied();
            let known = self.retired.contains_key(dep)
                || target.is_some_and(|t| !self.node(t).is_placeholder());
            if self.options.strict_dependencies && !known {
                return Err(ShuttleError::UnknownDependency {
                    job: id.clone(),
                    dependency: dep.clone(),
                });
            }
            if self.options.reject_cycles
                && let (Some(from), Some(to)) = (existing, target)
                && let Some(cycle) = self.path_closing_cycle(from, to)
            {
                return Err(ShuttleError::DependencyCycle(cycle));
            }
        }
        Ok(())
    }

    /// Add one edge `from -> dep`. Duplicate edges are ignored.
    fn link(&mut self, from: usize, dep: &JobId) {
        if self.node(from).deps.contains(dep) {
            return;
        }
        let from_id = self.node(from).id.clone();
        self.node_mut(from).deps.push(dep.clone());

        if let Some(&terminal) = self.retired.get(dep) {
            self.mirror.edge(&from_id, dep);
            let resolved = terminal == JobState::Completed
                || self.options.failure_policy == FailurePolicy::Release;
            if !resolved {
                let node = self.node_mut(from);
                node.blocked_by.get_or_insert_with(|| dep.clone());
            }
            return;
        }

        let to = match self.index.get(dep) {
            Some(&idx) => idx,
            None => {
                self.mirror.vertex(dep);
                self.allocate(Node::placeholder(dep.clone()))
            }
        };
        self.mirror.edge(&from_id, dep);
        self.node_mut(from).pending.insert(to);
        self.node_mut(to).dependents.insert(from);
    }

    fn set_state(&mut self, idx: usize, state: JobState) {
        let node = self.node_mut(idx);
        let Some(record) = node.record.as_mut() else {
            return;
        };
        record.transition(state);
        let (id, job_type) = (record.id.clone(), record.job_type.clone());
        self.mirror.state(&id, &job_type, state);
    }

    fn promote(&mut self, idx: usize) -> Promoted {
        self.set_state(idx, JobState::Ready);
        let node = self.node(idx);
        let job_type = node
            .record
            .as_ref()
            .map(|r| r.job_type.clone())
            .expect("only declared jobs are promoted");
        debug!(job_id = %node.id, "job ready");
        Promoted {
            id: node.id.clone(),
            job_type,
        }
    }

    fn advance(&mut self, id: &JobId, from: JobState, to: JobState) -> Result<(), ShuttleError> {
        let idx = self.live_index(id)?;
        let current = self.node(idx).state().unwrap_or(JobState::Declared);
        if current != from {
            return Err(ShuttleError::InvalidTransition {
                id: id.clone(),
                from: current,
                to,
            });
        }
        self.set_state(idx, to);
        self.mirror.commit();
        Ok(())
    }

    /// Fail `start` and, under `Block`, every finalized job that transitively
    /// waits on it. Unfinalized dependents are only marked blocked.
    fn fail_node(&mut self, start: usize, terminal: JobState, reason: String) -> Effects {
        let mut effects = Effects::default();
        let mut work = vec![(start, terminal, reason)];

        while let Some((idx, state, reason)) = work.pop() {
            // A diamond can queue the same dependent twice; the first pop retires it.
            let skip = match self.nodes[idx].as_ref() {
                Some(node) => node.state().is_none_or(|s| s.is_terminal()),
                None => true,
            };
            if skip {
                continue;
            }
            if let Some(record) = self.node_mut(idx).record.as_mut() {
                record.fail(state, reason.clone());
            }
            let (id, job_type) = {
                let node = self.node(idx);
                let job_type = node.record.as_ref().map(|r| r.job_type.clone());
                (node.id.clone(), job_type)
            };
            if let Some(job_type) = &job_type {
                self.mirror.state(&id, job_type, state);
            }
            if idx != start
                && let Some(job_type) = job_type
            {
                effects.failed.push(Cascaded {
                    id: id.clone(),
                    job_type,
                    reason,
                });
            }

            let dependents: Vec<usize> = self.node(idx).dependents.iter().copied().collect();
            for d in dependents {
                self.node_mut(d).pending.remove(&idx);
                match self.options.failure_policy {
                    FailurePolicy::Release => {
                        if self.node(d).can_promote() {
                            effects.ready.push(self.promote(d));
                        }
                    }
                    FailurePolicy::Block => {
                        let node = self.node_mut(d);
                        node.blocked_by.get_or_insert_with(|| id.clone());
                        if node.is_finalized() {
                            let cause = format!("dependency {id} did not complete");
                            work.push((d, JobState::Failed, cause));
                        }
                    }
                }
            }
            self.node_mut(idx).dependents.clear();
            self.retire(idx);
        }
        effects
    }

    /// Free a terminal node's slot and detach it from anything it still waits on.
    fn retire(&mut self, idx: usize) {
        let Some(node) = self.nodes[idx].take() else {
            return;
        };
        self.index.remove(&node.id);
        self.free.push(idx);
        if let Some(state) = node.state() {
            self.retired.insert(node.id.clone(), state);
        }

        for dep in node.pending {
            let Some(dep_node) = self.nodes[dep].as_mut() else {
                continue;
            };
            dep_node.dependents.remove(&idx);
            // A placeholder nobody waits for any more is garbage.
            if dep_node.is_placeholder() && dep_node.dependents.is_empty() {
                self.retire(dep);
            }
        }
    }
}

impl Default for DependencyLedger {
    fn default() -> Self {
        Self::new(LedgerOptions::default())
    }
}

#[cfg(test)]
mod tests;
