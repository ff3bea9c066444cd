//! Sequential execution of one lane.
//!
//! A [`Runner`] owns a FIFO of units and runs them one at a time. It never
//! blocks: every [`tick`](Runner::tick) either starts the next unit (when the
//! shared [`Delayer`] allows it), polls the unit in flight, or classifies the
//! unit that just finished.
//!
//! # Example
//!
//! ```
//! use splitrun::orchestrator::{Delayer, Runner};
//!
//! let mut runner = Runner::new(Delayer::unlimited(), Vec::new());
//! assert!(!runner.tick());
//! assert!(runner.has_empty_queue());
//! ```

use std::collections::VecDeque;

use indicatif::ProgressBar;
use tracing::debug;

use super::Delayer;
use crate::unit::BoxedUnit;

/// Drives one lane of units.
pub struct Runner {
    delayer: Delayer,
    label: String,
    queue: VecDeque<BoxedUnit>,
    current: Option<BoxedUnit>,
    failed: Vec<BoxedUnit>,
    timed_out: Vec<BoxedUnit>,
    marked_skipped: Vec<BoxedUnit>,
    passed: Vec<(String, u64)>,
    progress: Option<ProgressBar>,
}

impl Runner {
    pub fn new(delayer: Delayer, queue: impl IntoIterator<Item = BoxedUnit>) -> Self {
        Self {
            delayer,
            label: String::new(),
            queue: queue.into_iter().collect(),
            current: None,
            failed: Vec::new(),
            timed_out: Vec::new(),
            marked_skipped: Vec::new(),
            passed: Vec::new(),
            progress: None,
        }
    }

    /// Prefix for this lane's log lines, e.g. `(RERUN)`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Progress bar advanced for every passed unit.
    pub fn with_progress(mut self, progress: Option<ProgressBar>) -> Self {
        self.progress = progress;
        self
    }

    /// Advances the lane by one step.
    ///
    /// Returns `false` once the queue is drained and no unit is in flight.
    pub fn tick(&mut self) -> bool {
        let Some(unit) = self.current.as_mut() else {
            if self.queue.is_empty() {
                return false;
            }
            if self.delayer.allows_start()
                && let Some(mut unit) = self.queue.pop_front()
            {
                unit.start();
                self.current = Some(unit);
            }
            return true;
        };

        if unit.is_running() {
            return true;
        }

        if let Some(unit) = self.current.take() {
            self.classify(unit);
        }
        true
    }

    fn classify(&mut self, unit: BoxedUnit) {
        if unit.is_successful() {
            debug!("{}[PASS] {}", self.prefix(), unit.id());
            self.passed
                .push((unit.id().to_string(), unit.actual_duration().unwrap_or(0)));
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        } else if unit.is_timed_out() {
            debug!("{}     [TIMEOUT] {}", self.prefix(), unit.id());
            self.timed_out.push(unit);
        } else if unit.is_marked_skipped() {
            debug!("{}     [SKIPPED] {}", self.prefix(), unit.id());
            self.marked_skipped.push(unit);
        } else {
            debug!("{}     [FAIL] {}", self.prefix(), unit.id());
            self.failed.push(unit);
        }
    }

    fn prefix(&self) -> String {
        if self.label.is_empty() {
            String::new()
        } else {
            format!("{} ", self.label)
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn has_unit_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_empty_queue(&self) -> bool {
        self.queue.is_empty()
    }

    /// Units waiting in the queue, not counting the one in flight.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Takes the next waiting unit off the front of the queue.
    pub fn pop_queue(&mut self) -> Option<BoxedUnit> {
        self.queue.pop_front()
    }

    pub fn failed(&self) -> &[BoxedUnit] {
        &self.failed
    }

    pub fn passed(&self) -> &[(String, u64)] {
        &self.passed
    }

    pub fn take_failed(&mut self) -> Vec<BoxedUnit> {
        std::mem::take(&mut self.failed)
    }

    pub fn take_timed_out(&mut self) -> Vec<BoxedUnit> {
        std::mem::take(&mut self.timed_out)
    }

    pub fn take_marked_skipped(&mut self) -> Vec<BoxedUnit> {
        std::mem::take(&mut self.marked_skipped)
    }

    pub fn take_passed(&mut self) -> Vec<(String, u64)> {
        std::mem::take(&mut self.passed)
    }
}
