//! Progress reporting model.
//!
//! Percent convention:
//! - `0`: not started
//! - `1..=99`: running
//! - `100`: done
//! - negative: failed. The magnitude is the percent reached at failure,
//!   or `-1` if the job failed before it started.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::JobId;

pub const PERCENT_DONE: i32 = 100;

/// Terminal snapshots kept when no retention is configured.
pub const DEFAULT_PROGRESS_RETENTION: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub percent: i32,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,

    pub start_time: DateTime<Utc>,
}

impl ProgressState {
    pub fn not_started() -> Self {
        Self {
            percent: 0,
            message: String::new(),
            metrics: BTreeMap::new(),
            start_time: Utc::now(),
        }
    }

    /// A running snapshot. `percent` is clamped into `1..=99`.
    pub fn running(percent: i32, message: impl Into<String>) -> Self {
        Self {
            percent: percent.clamp(1, PERCENT_DONE - 1),
            message: message.into(),
            ..Self::not_started()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    /// Derive the terminal "done" snapshot from this one.
    pub fn done(&self) -> Self {
        Self {
            percent: PERCENT_DONE,
            ..self.clone()
        }
    }

    /// Derive the terminal "failed" snapshot from this one.
    pub fn failed(&self, message: impl Into<String>) -> Self {
        let percent = if self.percent > 0 { -self.percent } else { -1 };
        Self {
            percent,
            message: message.into(),
            ..self.clone()
        }
    }

    pub fn is_started(&self) -> bool {
        self.percent != 0
    }

    pub fn is_running(&self) -> bool {
        (1..PERCENT_DONE).contains(&self.percent)
    }

    pub fn is_done(&self) -> bool {
        self.percent == PERCENT_DONE
    }

    pub fn is_failed(&self) -> bool {
        self.percent < 0
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::not_started()
    }
}

/// Latest progress per job.
///
/// Live snapshots stay until the job finishes. Terminal snapshots go into
/// an LRU of `retention` entries, so the oldest finished jobs are forgotten.
pub struct ProgressBook {
    live: HashMap<JobId, ProgressState>,
    finished: LruCache<JobId, ProgressState>,
}

impl ProgressBook {
    /// A `retention` of 0 is treated as 1.
    pub fn new(retention: usize) -> Self {
        Self {
            live: HashMap::new(),
            finished: LruCache::new(NonZeroUsize::new(retention).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn get(&self, id: &JobId) -> Option<&ProgressState> {
        self.live.get(id).or_else(|| self.finished.peek(id))
    }

    /// Record a running snapshot. Ignored once the job has finished.
    pub fn update(&mut self, id: JobId, state: ProgressState) {
        if !self.finished.contains(&id) {
            self.live.insert(id, state);
        }
    }

    /// Turn the last snapshot into a terminal one and retain it.
    pub fn finish(&mut self, id: &JobId, success: bool, error: Option<&str>) -> &ProgressState {
        let last = self
            .live
            .remove(id)
            .or_else(|| self.finished.pop(id))
            .unwrap_or_default();
        let terminal = if success {
            last.done()
        } else {
            last.failed(error.unwrap_or_default())
        };
        self.finished.get_or_insert(id.clone(), || terminal)
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }
}

impl Default for ProgressBook {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_RETENTION)
    }
}
