//! Adaptive batches: whole file first, failing methods afterwards.
//!
//! ```text
//!             first start()                later start()
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │ WholeBatch over the file     │  │ inner Runner over the failed │
//! │ failed records ─► children   │  │ children, one at a time      │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!                 │
//!                 └─ explode(): children handed to the supervisor and
//!                    rerun in parallel, implode() folds them back
//! ```
//!
//! Durations are accumulated across all runs: the time of every method that
//! passed counts towards the unit, and is subtracted from the estimate of
//! what is left to run.

use std::collections::BTreeMap;
use std::mem;

use super::{BoxedUnit, TestUnit, UnitFactory, UnitKind, WholeBatchUnit};
use crate::orchestrator::Runner;

/// Which run the unit's getters describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// The whole-file batch ran last.
    Batch,
    /// Children ran last, either inside this unit or exploded.
    Children,
}

/// AdaptiveBatch unit.
pub struct ClusterTestUnit {
    factory: UnitFactory,
    batch: WholeBatchUnit,
    mode: Mode,
    /// Failed children waiting for the next run.
    children: Vec<BoxedUnit>,
    timed_out_children: Vec<BoxedUnit>,
    runner: Option<Runner>,
    /// Identities of children currently handed out by `explode`.
    exploded: Vec<String>,
    started_with: usize,
    settled: bool,
    has_passed_this_run: bool,
    output: String,
    error_output: String,
    status: String,
    expected: f64,
    actual: f64,
}

impl ClusterTestUnit {
    pub(crate) fn new(factory: UnitFactory, mut batch: WholeBatchUnit) -> Self {
        // every failure must be known to build the children
        batch.set_fail_fast(false);
        Self {
            factory,
            batch,
            mode: Mode::Batch,
            children: Vec::new(),
            timed_out_children: Vec::new(),
            runner: None,
            exploded: Vec::new(),
            started_with: 0,
            settled: false,
            has_passed_this_run: false,
            output: String::new(),
            error_output: String::new(),
            status: String::new(),
            expected: 0.0,
            actual: 0.0,
        }
    }

    /// Failed children currently owned by the unit.
    pub fn failed_children(&self) -> &[BoxedUnit] {
        &self.children
    }

    /// At least half of the units the last run started with failed.
    ///
    /// For the batch run the base is the number of methods the tool reported;
    /// for a children run it is the number of children started.
    pub fn is_explodable(&self) -> bool {
        !self.children.is_empty() && self.started_with > 0 && self.children.len() * 2 >= self.started_with
    }

    /// Hands the failed children out for parallel reruns.
    ///
    /// The unit remembers their identities; [`implode`](Self::implode)
    /// folds their outcomes back in.
    pub fn explode(&mut self) -> Vec<BoxedUnit> {
        self.mode = Mode::Children;
        let children = mem::take(&mut self.children);
        self.exploded = children.iter().map(|child| child.id().to_string()).collect();
        children
    }

    /// Folds the outcomes of exploded children back into this unit.
    ///
    /// `passed` maps identities of passed units to their durations;
    /// `still_failing` holds this unit's exploded children that never passed.
    pub fn implode(&mut self, passed: &BTreeMap<String, u64>, still_failing: Vec<BoxedUnit>) {
        let exploded = mem::take(&mut self.exploded);
        let passed_secs: u64 = exploded.iter().filter_map(|id| passed.get(id)).sum();
        self.account_passed_time(passed_secs as f64);

        let (timed_out, failed): (Vec<_>, Vec<_>) =
            still_failing.into_iter().partition(|child| child.is_timed_out());
        self.children = failed;
        self.timed_out_children = timed_out;
        self.collect_strings();
    }

    fn account_passed_time(&mut self, secs: f64) {
        self.actual += secs;
        if self.batch.expected_duration().is_some() {
            self.expected = (self.expected - secs).max(1.0);
        }
    }

    fn settle_batch_run(&mut self) {
        let passed_secs: f64 = self.batch.passed_records().map(|record| record.duration_secs).sum();
        self.actual += passed_secs;
        if let Some(expected) = self.batch.expected_duration() {
            self.expected = (expected as f64 - passed_secs).max(1.0);
        }

        let file = self.batch.file().to_string();
        let parent = self.batch.id().to_string();
        let mut methods: Vec<String> = Vec::new();
        for record in self.batch.failed_records() {
            let method = record.method().to_string();
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        self.started_with = self.batch.passed_records().count() + methods.len();
        self.children = methods
            .iter()
            .map(|method| Box::new(self.factory.exploded_child(&parent, &file, method)) as BoxedUnit)
            .collect();
    }

    fn settle_children_run(&mut self, mut runner: Runner) {
        let passed = runner.take_passed();
        self.has_passed_this_run = !passed.is_empty();
        let passed_secs: u64 = passed.iter().map(|(_, secs)| secs).sum();
        self.account_passed_time(passed_secs as f64);

        self.children = runner.take_failed();
        self.timed_out_children = runner.take_timed_out();
        self.collect_strings();
    }

    fn collect_strings(&mut self) {
        let failing = || self.children.iter().chain(self.timed_out_children.iter());
        let join = |parts: Vec<String>| {
            parts
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        };

        let output = join(failing().map(|child| child.output()).collect());
        let error_output = join(failing().map(|child| child.error_output()).collect());
        let status = join(
            failing()
                .map(|child| format!("{}: {}", child.id(), child.status_description()))
                .collect(),
        );
        self.output = output;
        self.error_output = error_output;
        self.status = status;
    }

    fn reset(&mut self) {
        self.runner = None;
        self.settled = false;
        self.has_passed_this_run = false;
        self.started_with = 0;
        self.output.clear();
        self.error_output.clear();
        self.status.clear();
    }
}

impl TestUnit for ClusterTestUnit {
    fn id(&self) -> &str {
        self.batch.id()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::AdaptiveBatch
    }

    fn file(&self) -> &str {
        self.batch.file()
    }

    fn start(&mut self) {
        self.reset();
        self.timed_out_children.clear();

        if self.children.is_empty() {
            self.mode = Mode::Batch;
            self.batch.start();
            return;
        }

        self.mode = Mode::Children;
        self.started_with = self.children.len();
        let children = mem::take(&mut self.children);
        self.runner = Some(Runner::new(self.factory.delayer().clone(), children).with_label("(RERUN)"));
    }

    fn is_running(&mut self) -> bool {
        if self.settled {
            return false;
        }

        match self.runner.as_mut() {
            None => {
                if self.batch.is_running() {
                    return true;
                }
                self.settle_batch_run();
            }
            Some(runner) => {
                if runner.tick() {
                    return true;
                }
                if let Some(runner) = self.runner.take() {
                    self.settle_children_run(runner);
                }
            }
        }

        self.settled = true;
        false
    }

    fn is_timed_out(&self) -> bool {
        match self.mode {
            Mode::Batch => self.batch.is_timed_out(),
            Mode::Children => self.children.is_empty() && !self.timed_out_children.is_empty(),
        }
    }

    fn is_successful(&self) -> bool {
        match self.mode {
            Mode::Batch => self.batch.is_successful(),
            Mode::Children => self.children.is_empty() && self.timed_out_children.is_empty(),
        }
    }

    fn status_description(&self) -> String {
        match self.mode {
            Mode::Batch => self.batch.status_description(),
            Mode::Children => self.status.clone(),
        }
    }

    fn output(&self) -> String {
        match self.mode {
            Mode::Batch => self.batch.output(),
            Mode::Children => self.output.clone(),
        }
    }

    fn error_output(&self) -> String {
        match self.mode {
            Mode::Batch => self.batch.error_output(),
            Mode::Children => self.error_output.clone(),
        }
    }

    fn expected_duration(&self) -> Option<u64> {
        match self.mode {
            Mode::Batch => self.batch.expected_duration(),
            Mode::Children => self
                .batch
                .expected_duration()
                .map(|_| self.expected.ceil() as u64),
        }
    }

    fn set_expected_duration(&mut self, secs: u64) {
        if self.batch.expected_duration().is_none() {
            // time already spent passing counts against the late estimate
            self.expected = (secs as f64 - self.actual).max(1.0);
        }
        self.batch.set_expected_duration(secs);
    }

    fn actual_duration(&self) -> Option<u64> {
        match self.mode {
            Mode::Batch => self.batch.actual_duration(),
            Mode::Children => Some(self.actual.ceil() as u64),
        }
    }

    fn has_passed_tests_this_run(&self) -> bool {
        match self.mode {
            Mode::Batch => self.batch.has_passed_tests_this_run(),
            Mode::Children => self.has_passed_this_run,
        }
    }

    fn as_cluster_mut(&mut self) -> Option<&mut ClusterTestUnit> {
        Some(self)
    }

    fn reset_for_rerun(&self) -> BoxedUnit {
        Box::new(Self::new(self.factory.clone(), self.batch.fresh_copy()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Delayer;
    use crate::unit::testing::{FakeLauncher, FakeRun, fake_context};

    fn run(unit: &mut dyn TestUnit) {
        unit.start();
        while unit.is_running() {}
    }

    fn four_methods_three_failing() -> FakeRun {
        FakeRun::records(&[
            ("A: one", "pass", 1.5),
            ("A: two", "fail", 2.0),
            ("A: three", "fail", 2.0),
            ("A: four", "error", 2.0),
        ])
    }

    #[tokio::test]
    async fn test_first_run_builds_children_from_failed_methods() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [four_methods_three_failing()]);
        let (ctx, _dir) = fake_context(launcher);
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        unit.set_expected_duration(20);
        run(&mut unit);

        assert!(!unit.is_successful());
        assert!(unit.has_passed_tests_this_run());
        assert!(unit.is_explodable());
        let children: Vec<_> = unit.failed_children().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(
            children,
            vec!["tests/A.php:two", "tests/A.php:three", "tests/A.php:four"]
        );
        assert!(unit.failed_children().iter().all(|c| c.parent_id() == Some("tests/A.php")));
        assert_eq!(unit.expected_duration(), Some(20));
        assert_eq!(unit.actual_duration(), Some(8));
    }

    #[tokio::test]
    async fn test_explode_then_implode_after_children_pass() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [four_methods_three_failing()]);
        let (ctx, _dir) = fake_context(launcher);
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        unit.set_expected_duration(20);
        run(&mut unit);

        let mut children = unit.explode();
        assert_eq!(children.len(), 3);
        assert!(unit.failed_children().is_empty());

        let mut passed = BTreeMap::new();
        for child in children.iter_mut() {
            run(child.as_mut());
            assert!(child.is_successful());
            passed.insert(child.id().to_string(), child.actual_duration().unwrap());
        }
        passed.insert("tests/Other.php:x".to_string(), 100);

        unit.implode(&passed, Vec::new());

        assert!(unit.is_successful());
        // 1.5s passed in the batch run + 3 x 1s children, rounded up once
        assert_eq!(unit.actual_duration(), Some(5));
        // 20 - 1.5 - 3
        assert_eq!(unit.expected_duration(), Some(16));
    }

    #[tokio::test]
    async fn test_implode_keeps_still_failing_children() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [four_methods_three_failing()]);
        launcher.script("tests/A.php:two", [FakeRun::records(&[("two", "fail", 1.0)])]);
        let (ctx, _dir) = fake_context(launcher);
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        run(&mut unit);

        let mut passed = BTreeMap::new();
        let mut still_failing = Vec::new();
        for mut child in unit.explode() {
            run(child.as_mut());
            if child.is_successful() {
                passed.insert(child.id().to_string(), child.actual_duration().unwrap());
            } else {
                still_failing.push(child);
            }
        }

        unit.implode(&passed, still_failing);

        assert!(!unit.is_successful());
        assert_eq!(unit.failed_children().len(), 1);
        assert_eq!(unit.status_description(), "tests/A.php:two: two fail");
        // no estimate was ever supplied
        assert_eq!(unit.expected_duration(), None);
    }

    #[tokio::test]
    async fn test_late_estimate_applies_to_exploded_unit() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [four_methods_three_failing()]);
        let (ctx, _dir) = fake_context(launcher);
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        run(&mut unit);
        let _children = unit.explode();
        assert_eq!(unit.expected_duration(), None);

        unit.set_expected_duration(10);
        // 10 - 1.5
        assert_eq!(unit.expected_duration(), Some(9));
    }

    #[tokio::test]
    async fn test_rerun_without_explode_runs_children_sequentially() {
        let launcher = FakeLauncher::new();
        launcher.script(
            "tests/A.php",
            [FakeRun::records(&[
                ("A: one", "pass", 1.0),
                ("A: two", "pass", 1.0),
                ("A: three", "fail", 1.0),
            ])],
        );
        let (ctx, _dir) = fake_context(launcher.clone());
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        run(&mut unit);
        assert!(!unit.is_explodable());

        run(&mut unit);

        assert!(unit.is_successful());
        assert!(unit.has_passed_tests_this_run());
        assert_eq!(launcher.started(), vec!["tests/A.php", "tests/A.php:three"]);
        // 2s from the batch run + 1s from the rerun
        assert_eq!(unit.actual_duration(), Some(3));
    }

    #[tokio::test]
    async fn test_broken_batch_has_no_children() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [FakeRun::broken("boom")]);
        let (ctx, _dir) = fake_context(launcher);
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        run(&mut unit);

        assert!(!unit.is_successful());
        assert!(!unit.has_passed_tests_this_run());
        assert!(!unit.is_explodable());
        assert_eq!(unit.status_description(), "tests/A.php: BROKEN boom");
    }

    #[tokio::test]
    async fn test_reset_for_rerun_drops_children() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php", [four_methods_three_failing()]);
        let (ctx, _dir) = fake_context(launcher.clone());
        let factory = UnitFactory::new(ctx, Delayer::unlimited());

        let mut unit = factory.adaptive_batch("tests/A.php");
        unit.set_expected_duration(9);
        run(&mut unit);

        let mut copy = unit.reset_for_rerun();
        assert_eq!(copy.id(), "tests/A.php");
        assert_eq!(copy.kind(), UnitKind::AdaptiveBatch);
        assert_eq!(copy.expected_duration(), Some(9));
        assert!(copy.as_cluster_mut().unwrap().failed_children().is_empty());

        run(copy.as_mut());
        // the copy reruns the whole file, not the failed methods
        assert_eq!(launcher.started(), vec!["tests/A.php", "tests/A.php"]);
        assert!(copy.is_successful());
    }
}
