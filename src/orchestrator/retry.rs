//! Rerun accounting.

use std::collections::HashMap;

/// Counts reruns consumed per unit identity during one supervisor run.
///
/// Checking a unit consumes an attempt: the first check of a failed unit
/// records zero reruns, each later check one more. A unit is exhausted once
/// its count reaches the limit.
#[derive(Debug, Default)]
pub struct RerunLedger {
    limit: usize,
    counts: HashMap<String, usize>,
}

impl RerunLedger {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Records a failure of `id`; returns whether it may be rerun.
    pub fn admit(&mut self, id: &str) -> bool {
        let count = self
            .counts
            .entry(id.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(0);
        *count < self.limit
    }

    /// Reruns consumed so far.
    pub fn count(&self, id: &str) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }

    /// Starts `child` from the reruns its parent already consumed.
    pub fn inherit(&mut self, child: &str, parent: &str) {
        if let Some(&count) = self.counts.get(parent) {
            self.counts.entry(child.to_string()).or_insert(count);
        }
    }
}
