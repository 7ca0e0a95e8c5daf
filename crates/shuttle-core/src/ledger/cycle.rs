//! Cycle detection over unresolved dependency edges.
//!
//! Resolved edges cannot be part of a cycle (the dependency already finished),
//! so only `pending` edges are walked.

use std::collections::HashMap;

use super::DependencyLedger;
use crate::domain::JobId;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyLedger {
    /// Would adding `from -> to` close a cycle?
    ///
    /// Returns the cycle path `from -> to -> ... -> from` if `from` is
    /// reachable from `to` through pending edges.
    pub(super) fn path_closing_cycle(&self, from: usize, to: usize) -> Option<Vec<JobId>> {
        if from == to {
            let id = self.node(from).id.clone();
            return Some(vec![id.clone(), id]);
        }

        let mut prev: HashMap<usize, usize> = HashMap::new();
        let mut stack = vec![to];
        let mut seen = std::collections::HashSet::from([to]);
        while let Some(current) = stack.pop() {
            for &next in &self.node(current).pending {
                if !seen.insert(next) {
                    continue;
                }
                prev.insert(next, current);
                if next == from {
                    let mut path = vec![self.node(from).id.clone()];
                    let mut cursor = from;
                    while let Some(&p) = prev.get(&cursor) {
                        path.push(self.node(p).id.clone());
                        cursor = p;
                    }
                    // path is from <- ... <- to; flip and close the loop.
                    path.reverse();
                    path.insert(0, self.node(from).id.clone());
                    return Some(path);
                }
                stack.push(next);
            }
        }
        None
    }

    /// Detect any cycle among live jobs (three-color DFS).
    ///
    /// Returns the first cycle found, or `None` if the unresolved graph is a DAG.
    /// The walk keeps its own stack, so chain length is bounded by memory only.
    pub fn detect_cycle(&self) -> Option<Vec<JobId>> {
        let mut color = vec![Color::White; self.nodes.len()];
        for (start, slot) in self.nodes.iter().enumerate() {
            if slot.is_none() || color[start] != Color::White {
                continue;
            }
            color[start] = Color::Gray;
            let mut stack = vec![(start, self.node(start).pending.iter())];

            while let Some((node, deps)) = stack.last_mut() {
                let node = *node;
                let Some(&dep) = deps.next() else {
                    color[node] = Color::Black;
                    stack.pop();
                    continue;
                };
                match color[dep] {
                    Color::Gray => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<JobId> = stack[from..]
                            .iter()
                            .map(|(n, _)| self.node(*n).id.clone())
                            .collect();
                        cycle.push(self.node(dep).id.clone());
                        return Some(cycle);
                    }
                    Color::White => {
                        color[dep] = Color::Gray;
                        stack.push((dep, self.node(dep).pending.iter()));
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }
}
