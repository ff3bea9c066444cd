//! One whole test file per subprocess.

use std::sync::Arc;

use tracing::debug;

use super::{BoxedUnit, Execution, Target, TestUnit, UnitContext, UnitKind};
use crate::report::{TestRecord, strip};

/// Runs every method of a test file in one subprocess.
///
/// A failing batch is rerun as a whole. In fail-fast mode the tool stops at
/// the first failing method, so later methods are neither passed nor failed.
pub struct WholeBatchUnit {
    ctx: Arc<UnitContext>,
    file: String,
    exec: Execution,
    fail_fast: Option<bool>,
    expected: Option<u64>,
}

impl WholeBatchUnit {
    pub(crate) fn new(ctx: Arc<UnitContext>, file: &str) -> Self {
        Self {
            ctx,
            file: file.to_string(),
            exec: Execution::default(),
            fail_fast: None,
            expected: None,
        }
    }

    /// Overrides the configured fail-fast mode for this batch.
    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = Some(fail_fast);
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(self.ctx.batch_fail_fast)
    }

    /// Methods that passed in the last run.
    pub fn passed_records(&self) -> impl Iterator<Item = &TestRecord> {
        self.records().filter(|record| record.is_passed())
    }

    /// Methods that failed or errored in the last run.
    pub fn failed_records(&self) -> impl Iterator<Item = &TestRecord> {
        self.records()
            .filter(|record| !record.is_passed() && !record.is_skipped())
    }

    fn records(&self) -> impl Iterator<Item = &TestRecord> {
        self.exec.records().unwrap_or_default().iter()
    }

    /// Fresh copy keeping identity, fail-fast override and estimate.
    pub(crate) fn fresh_copy(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            file: self.file.clone(),
            exec: Execution::default(),
            fail_fast: self.fail_fast,
            expected: self.expected,
        }
    }
}

impl TestUnit for WholeBatchUnit {
    fn id(&self) -> &str {
        &self.file
    }

    fn kind(&self) -> UnitKind {
        UnitKind::WholeBatch
    }

    fn file(&self) -> &str {
        &self.file
    }

    fn start(&mut self) {
        let extra_args = if self.is_fail_fast() {
            self.ctx.batch_fail_fast_args.clone()
        } else {
            Vec::new()
        };
        let target = Target {
            id: &self.file,
            file: &self.file,
            method: None,
        };
        self.exec.start(&self.ctx, &self.ctx.batch, &target, &extra_args);
    }

    fn is_running(&mut self) -> bool {
        let target = Target {
            id: &self.file,
            file: &self.file,
            method: None,
        };
        let running = self.exec.poll(&self.ctx.batch, &target);
        if !running && self.exec.records().is_none() {
            debug!("{} -> broken or timed out\n{}", self.file, self.exec.error_output());
        }
        running
    }

    fn is_timed_out(&self) -> bool {
        self.exec.is_timed_out()
    }

    fn is_successful(&self) -> bool {
        self.exec.records().is_some()
            && self.exec.exited_ok()
            && self.failed_records().next().is_none()
    }

    fn status_description(&self) -> String {
        if self.exec.is_timed_out() {
            return format!("{}: TIMEOUT", self.file);
        }
        if self.exec.records().is_none() {
            let stderr = strip(&console::strip_ansi_codes(&self.exec.error_output()));
            return format!("{}: BROKEN {}", self.file, stderr).trim_end().to_string();
        }

        let mut failed = self.failed_records().peekable();
        if self.is_fail_fast()
            && let Some(first) = failed.peek()
        {
            return format!(
                "{}:{} (and following): {}",
                self.file,
                first.method(),
                strip(&first.message)
            );
        }

        let lines: Vec<String> = failed
            .filter(|record| !record.message.trim().is_empty())
            .map(|record| format!("{}:{}: {}", self.file, record.method(), strip(&record.message)))
            .collect();
        if lines.is_empty() && !self.is_successful() {
            return format!("{}: FAILED", self.file);
        }
        lines.join("\n")
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

    fn has_passed_tests_this_run(&self) -> bool {
        self.passed_records().next().is_some()
    }

    fn reset_for_rerun(&self) -> BoxedUnit {
        Box::new(self.fresh_copy())
    }
}
