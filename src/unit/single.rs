//! One test method per subprocess.

use std::sync::Arc;

use super::{BoxedUnit, Execution, Target, TestUnit, UnitContext, UnitKind};
use crate::report::strip;

/// Runs a single method of a test file.
///
/// The verdict comes from the first record of the result artifact; a run
/// that left no parseable artifact is broken and never successful, whatever
/// the exit code.
pub struct SingleTestUnit {
    ctx: Arc<UnitContext>,
    id: String,
    file: String,
    method: String,
    parent: Option<String>,
    exec: Execution,
    expected: Option<u64>,
}

impl SingleTestUnit {
    pub(crate) fn new(ctx: Arc<UnitContext>, file: &str, method: &str, parent: Option<String>) -> Self {
        Self {
            ctx,
            id: format!("{file}:{method}"),
            file: file.to_string(),
            method: method.to_string(),
            parent,
            exec: Execution::default(),
            expected: None,
        }
    }

    fn first_record(&self) -> Option<&crate::report::TestRecord> {
        self.exec.records()?.first()
    }
}

impl TestUnit for SingleTestUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Single
    }

    fn file(&self) -> &str {
        &self.file
    }

    fn method(&self) -> Option<&str> {
        Some(&self.method)
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn start(&mut self) {
        let target = Target {
            id: &self.id,
            file: &self.file,
            method: Some(self.method.as_str()),
        };
        self.exec.start(&self.ctx, &self.ctx.single, &target, &[]);
    }

    fn is_running(&mut self) -> bool {
        let target = Target {
            id: &self.id,
            file: &self.file,
            method: Some(self.method.as_str()),
        };
        self.exec.poll(&self.ctx.single, &target)
    }

    fn is_timed_out(&self) -> bool {
        self.exec.is_timed_out()
    }

    fn is_successful(&self) -> bool {
        self.exec.exited_ok() && self.first_record().is_some_and(|record| record.is_passed())
    }

    fn is_marked_skipped(&self) -> bool {
        self.first_record().is_some_and(|record| record.is_skipped())
    }

    fn status_description(&self) -> String {
        if let Some(record) = self.first_record()
            && !record.message.is_empty()
        {
            return strip(&record.message);
        }
        if self.exec.is_timed_out() {
            return "TIMEOUT".to_string();
        }
        let stderr = strip(&console::strip_ansi_codes(&self.exec.error_output()));
        if self.exec.records().is_none() {
            return format!("BROKEN {stderr}").trim_end().to_string();
        }
        stderr
    }

    fn output(&self) -> String {
        self.exec.output()
    }

    fn error_output(&self) -> String {
        self.exec.error_output()
    }

    fn expected_duration(&self) -> Option<u64> {
        self.expected
    }

    fn set_expected_duration(&mut self, secs: u64) {
        self.expected = Some(secs);
    }

    fn actual_duration(&self) -> Option<u64> {
        self.exec.actual_duration()
    }

    fn reset_for_rerun(&self) -> BoxedUnit {
        let mut copy = Self::new(
            Arc::clone(&self.ctx),
            &self.file,
            &self.method,
            self.parent.clone(),
        );
        copy.expected = self.expected;
        Box::new(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::testing::{FakeLauncher, FakeRun, fake_context};

    fn run(unit: &mut SingleTestUnit) {
        unit.start();
        while unit.is_running() {}
    }

    #[tokio::test]
    async fn test_passing_run() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::records(&[("one", "pass", 3.0)])]);
        let (ctx, _dir) = fake_context(launcher.clone());

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        assert_eq!(unit.id(), "tests/A.php:one");
        assert_eq!(unit.actual_duration(), None);

        run(&mut unit);

        assert!(unit.is_successful());
        assert!(!unit.is_timed_out());
        assert!(!unit.is_marked_skipped());
        assert_eq!(unit.actual_duration(), Some(3));
        assert_eq!(launcher.started(), vec!["tests/A.php:one"]);
    }

    #[tokio::test]
    async fn test_failed_record_message() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::records(&[("one", "fail", 1.0)])]);
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        run(&mut unit);

        assert!(!unit.is_successful());
        assert_eq!(unit.status_description(), "one fail");
    }

    #[tokio::test]
    async fn test_skipped_record() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::records(&[("one", "skipped", 0.0)])]);
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        run(&mut unit);

        assert!(!unit.is_successful());
        assert!(unit.is_marked_skipped());
    }

    #[tokio::test]
    async fn test_broken_run_reports_stderr() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::broken("PHP Fatal error:\n  Class not found")]);
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        run(&mut unit);

        assert!(!unit.is_successful());
        assert_eq!(unit.status_description(), "BROKEN PHP Fatal error: Class not found");
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::hang()]);
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        run(&mut unit);

        assert!(unit.is_timed_out());
        assert!(!unit.is_successful());
        assert_eq!(unit.status_description(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_timeout_beats_a_passing_exit() {
        let launcher = FakeLauncher::new();
        launcher.script(
            "tests/A.php:one",
            [FakeRun::records(&[("one", "pass", 1.0)]).timing_out()],
        );
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", None);
        run(&mut unit);

        assert!(unit.is_timed_out());
        assert!(!unit.is_successful());
    }

    #[tokio::test]
    async fn test_reset_for_rerun_keeps_identity_only() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::records(&[("one", "fail", 1.0)])]);
        let (ctx, _dir) = fake_context(launcher);

        let mut unit = SingleTestUnit::new(ctx, "tests/A.php", "one", Some("tests/A.php".into()));
        unit.set_expected_duration(7);
        run(&mut unit);

        let mut copy = unit.reset_for_rerun();
        assert_eq!(copy.id(), unit.id());
        assert_eq!(copy.parent_id(), Some("tests/A.php"));
        assert_eq!(copy.expected_duration(), Some(7));
        assert_eq!(copy.actual_duration(), None);

        copy.start();
        while copy.is_running() {}
        assert!(copy.is_successful());
    }
}
