//! Multi-lane supervision.
//!
//! The supervisor sweeps a FIFO of [`Runner`]s, one tick each per sweep,
//! until every lane has drained:
//!
//! ```text
//!   ┌──────────────── sweep ────────────────┐
//!   │ pop lane ─► tick ─► still ticking? ─► push back
//!   │                         │ no
//!   │                         ▼
//!   │               merge lane results ─► (continuous) rerun lane
//!   └──────────────────────────────────────┘
//!   rebalance (continuous) ─► sleep(tick)
//! ```
//!
//! In continuous mode failed units are rerun as soon as their lane drains,
//! subject to the [`RerunLedger`]; exploded adaptive batches are folded back
//! together once all lanes are done.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::time::Duration;

use indicatif::ProgressBar;
use tracing::{debug, info};

use super::{Delayer, RerunLedger, Runner};
use crate::filter::NameFilter;
use crate::unit::BoxedUnit;

/// Rerun policy of one supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub rerun_count: usize,
    /// Rerun failed units while the run is still in progress.
    pub continuous: bool,
    /// Drop batches without progress from reruns and explode adaptive ones.
    pub fast_batch_rerun: bool,
    /// Log the output of the first failing unit as soon as it is known.
    pub show_first_fail: bool,
    /// Pause between sweeps.
    pub tick: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            rerun_count: 0,
            continuous: true,
            fast_batch_rerun: true,
            show_first_fail: false,
            tick: Duration::from_millis(20),
        }
    }
}

/// Where every unit of a supervisor run ended up.
#[derive(Debug, Default)]
pub struct SupervisorOutcome {
    /// Failed units that may still be rerun by the caller.
    pub failed: Vec<BoxedUnit>,
    pub failed_no_rerun: Vec<BoxedUnit>,
    pub timed_out: Vec<BoxedUnit>,
    pub marked_skipped: Vec<BoxedUnit>,
    /// Identity to actual duration in seconds.
    pub passed_durations: BTreeMap<String, u64>,
    /// Output of the first failure, when it was logged during this run.
    pub first_fail: Option<String>,
}

impl SupervisorOutcome {
    /// Every unit that did not pass and is not marked skipped.
    pub fn failing(&self) -> impl Iterator<Item = &BoxedUnit> {
        self.failed
            .iter()
            .chain(&self.failed_no_rerun)
            .chain(&self.timed_out)
    }
}

/// Drives all lanes of one run.
pub struct RunnersSupervisor {
    settings: SupervisorSettings,
    delayer: Delayer,
    skip_reruns: NameFilter,
    progress: Option<ProgressBar>,

    lanes: Vec<Vec<BoxedUnit>>,
    runners: VecDeque<Runner>,
    process_count: usize,
    ledger: RerunLedger,

    failed: Vec<BoxedUnit>,
    failed_no_rerun: Vec<BoxedUnit>,
    timed_out: Vec<BoxedUnit>,
    marked_skipped: Vec<BoxedUnit>,
    passed_durations: BTreeMap<String, u64>,
    /// Adaptive batches whose children were handed out for reruns.
    exploded: Vec<BoxedUnit>,
    first_fail: Option<String>,
}

impl RunnersSupervisor {
    pub fn new(settings: SupervisorSettings, delayer: Delayer, lanes: Vec<Vec<BoxedUnit>>) -> Self {
        let process_count = lanes.len();
        let ledger = RerunLedger::new(settings.rerun_count);

        Self {
            settings,
            delayer,
            skip_reruns: NameFilter::default(),
            progress: None,
            lanes,
            runners: VecDeque::new(),
            process_count,
            ledger,
            failed: Vec::new(),
            failed_no_rerun: Vec::new(),
            timed_out: Vec::new(),
            marked_skipped: Vec::new(),
            passed_durations: BTreeMap::new(),
            exploded: Vec::new(),
            first_fail: None,
        }
    }

    /// Units matching this filter are never rerun.
    pub fn with_skip_reruns(mut self, filter: NameFilter) -> Self {
        self.skip_reruns = filter;
        self
    }

    /// Progress bar advanced for every passed unit.
    pub fn with_progress(mut self, progress: Option<ProgressBar>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every lane to completion.
    pub async fn run(mut self) -> SupervisorOutcome {
        debug!("Running units in {} lane(s)", self.process_count);
        for lane in mem::take(&mut self.lanes) {
            let runner = self.new_runner(lane, "");
            self.runners.push_back(runner);
        }

        while !self.runners.is_empty() {
            let count = self.runners.len();
            for _ in 0..count {
                self.touch_runner();
            }
            self.take_some_burden();

            if !self.runners.is_empty() {
                tokio::time::sleep(self.settings.tick).await;
            }
        }

        self.implode_clusters();

        SupervisorOutcome {
            failed: self.failed,
            failed_no_rerun: self.failed_no_rerun,
            timed_out: self.timed_out,
            marked_skipped: self.marked_skipped,
            passed_durations: self.passed_durations,
            first_fail: self.first_fail,
        }
    }

    fn touch_runner(&mut self) {
        let Some(mut runner) = self.runners.pop_front() else {
            return;
        };

        self.show_first_fail(&runner);

        if runner.tick() {
            self.runners.push_back(runner);
            return;
        }

        self.save_finished(runner);

        if !self.settings.continuous {
            return;
        }

        let queue = self.units_for_rerun();
        if !queue.is_empty() {
            debug!("Rerunning {} unit(s)", queue.len());
            let runner = self.new_runner(queue, "(RERUN)");
            self.runners.push_back(runner);
        }
    }

    fn new_runner(&self, queue: Vec<BoxedUnit>, label: &str) -> Runner {
        Runner::new(self.delayer.clone(), queue)
            .with_label(label)
            .with_progress(self.progress.clone())
    }

    fn show_first_fail(&mut self, runner: &Runner) {
        if !self.settings.show_first_fail || self.first_fail.is_some() {
            return;
        }
        let Some(unit) = runner.failed().first() else {
            return;
        };

        let error = unit.error_output();
        let text = if error.trim().is_empty() {
            unit.output()
                .lines()
                .map(|line| format!("           {line}"))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            error.trim().to_string()
        };
        info!("{}", text);
        self.first_fail = Some(text);
    }

    fn save_finished(&mut self, mut runner: Runner) {
        for unit in runner.take_failed() {
            if !self.skip_reruns.is_empty() && unit.matches(&self.skip_reruns) {
                debug!("{} is excluded from reruns", unit.id());
                self.failed_no_rerun.push(unit);
            } else {
                self.failed.push(unit);
            }
        }
        self.timed_out.extend(runner.take_timed_out());
        self.marked_skipped.extend(runner.take_marked_skipped());
        self.passed_durations.extend(runner.take_passed());
    }

    fn units_for_rerun(&mut self) -> Vec<BoxedUnit> {
        let mut queue = Vec::new();
        if self.failed.is_empty() || self.settings.rerun_count == 0 {
            return queue;
        }

        for mut unit in mem::take(&mut self.failed) {
            let id = unit.id().to_string();
            if !self.ledger.admit(&id) {
                self.failed_no_rerun.push(unit);
                continue;
            }

            if unit.kind().is_batch() && self.settings.fast_batch_rerun {
                if !unit.has_passed_tests_this_run() {
                    debug!("{} is excluded from reruns: no unit passed in this run", id);
                    self.failed_no_rerun.push(unit);
                    continue;
                }

                if let Some(cluster) = unit.as_cluster_mut()
                    && cluster.is_explodable()
                {
                    debug!("{} is split into separate units rerun in parallel", id);
                    for child in cluster.explode() {
                        self.ledger.inherit(child.id(), &id);
                        queue.push(child);
                    }
                    self.exploded.push(unit);
                    continue;
                }
            }

            queue.push(unit);
        }
        queue
    }

    /// Moves half the backlog of the busiest lane into a new lane while a
    /// process slot is free.
    fn take_some_burden(&mut self) {
        if !self.settings.continuous || self.runners.len() >= self.process_count {
            return;
        }

        let Some(busiest) = self
            .runners
            .iter_mut()
            .filter(|runner| runner.has_unit_running() && !runner.has_empty_queue())
            .max_by_key(|runner| runner.queue_len())
        else {
            return;
        };

        let take = busiest.queue_len().div_ceil(2);
        let queue: Vec<BoxedUnit> = (0..take).filter_map(|_| busiest.pop_queue()).collect();
        let label = busiest.label().to_string();

        debug!("{} unit(s) moved to a new lane, because there is a free process", take);
        let runner = self.new_runner(queue, &label);
        self.runners.push_back(runner);
    }

    fn implode_clusters(&mut self) {
        if !self.settings.continuous || self.exploded.is_empty() {
            return;
        }

        for mut parent in mem::take(&mut self.exploded) {
            let id = parent.id().to_string();
            let mut still_failing = drain_children(&mut self.failed_no_rerun, &id);
            still_failing.extend(drain_children(&mut self.timed_out, &id));
            still_failing.extend(drain_children(&mut self.failed, &id));

            if let Some(cluster) = parent.as_cluster_mut() {
                cluster.implode(&self.passed_durations, still_failing);
            }

            if parent.is_successful() {
                if let Some(progress) = &self.progress {
                    progress.inc(1);
                }
                self.passed_durations
                    .insert(id, parent.actual_duration().unwrap_or(0));
            } else {
                self.failed_no_rerun.push(parent);
            }
        }
    }
}

fn drain_children(units: &mut Vec<BoxedUnit>, parent: &str) -> Vec<BoxedUnit> {
    let (children, rest): (Vec<_>, Vec<_>) = mem::take(units)
        .into_iter()
        .partition(|unit| unit.parent_id() == Some(parent));
    *units = rest;
    children
}
