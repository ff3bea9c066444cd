//! Schedulable test units.
//!
//! A unit wraps one subprocess invocation of the external test tool and
//! exposes a uniform, non-blocking lifecycle to the scheduler:
//!
//! ```text
//! start() ──► is_running() … is_running() ──► classify
//!                                              ├─ is_successful()
//!                                              ├─ is_timed_out()
//!                                              ├─ is_marked_skipped()
//!                                              └─ otherwise failed
//! ```
//!
//! | Variant | Type | Subprocess |
//! |---------|------|------------|
//! | Single | [`SingleTestUnit`] | one method of one file |
//! | WholeBatch | [`WholeBatchUnit`] | a whole file |
//! | AdaptiveBatch | [`ClusterTestUnit`] | a whole file first, then its failing methods |

pub mod batch;
pub mod cluster;
pub mod factory;
pub mod single;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::filter::NameFilter;
use crate::provider::{Command, ProcessHandle, ProcessLauncher, ProviderResult};
use crate::report::{ResultLogParser, TestRecord};

pub use batch::WholeBatchUnit;
pub use cluster::ClusterTestUnit;
pub use factory::UnitFactory;
pub use single::SingleTestUnit;

/// Owned, type-erased unit as it travels through queues.
pub type BoxedUnit = Box<dyn TestUnit>;

/// Which variant a unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Single,
    WholeBatch,
    AdaptiveBatch,
}

impl UnitKind {
    /// Whether the unit runs a whole file.
    pub fn is_batch(self) -> bool {
        !matches!(self, UnitKind::Single)
    }
}

/// Lifecycle shared by every unit variant.
///
/// Only `start` and `is_running` mutate: the classification getters read the
/// state captured when the unit observed its process finish.
pub trait TestUnit: Send {
    /// Stable identity used for deduplication, rerun accounting and statistics.
    fn id(&self) -> &str;

    fn kind(&self) -> UnitKind;

    /// Test file the unit belongs to.
    fn file(&self) -> &str;

    /// Method name for single-method units.
    fn method(&self) -> Option<&str> {
        None
    }

    /// Identity of the adaptive batch this unit was exploded from.
    fn parent_id(&self) -> Option<&str> {
        None
    }

    /// Starts a fresh run, discarding the previous run's state.
    fn start(&mut self);

    /// Non-blocking poll. Returns `false` once the run is over.
    fn is_running(&mut self) -> bool;

    fn is_timed_out(&self) -> bool;

    fn is_successful(&self) -> bool;

    /// The test itself signalled a skip.
    fn is_marked_skipped(&self) -> bool {
        false
    }

    /// One or more lines explaining a non-successful run.
    fn status_description(&self) -> String;

    fn output(&self) -> String;

    fn error_output(&self) -> String;

    /// Estimated run time in seconds, when statistics know the unit.
    fn expected_duration(&self) -> Option<u64>;

    fn set_expected_duration(&mut self, secs: u64);

    /// Measured run time in seconds; `None` until the unit finished a run.
    fn actual_duration(&self) -> Option<u64>;

    /// For batches: whether at least one method passed in the last run.
    fn has_passed_tests_this_run(&self) -> bool {
        false
    }

    fn as_cluster_mut(&mut self) -> Option<&mut ClusterTestUnit> {
        None
    }

    /// Fresh copy with the same identity and no run state.
    fn reset_for_rerun(&self) -> BoxedUnit;

    /// The filter entry selecting this unit.
    fn name_match<'f>(&self, filter: &'f NameFilter) -> Option<&'f str> {
        filter.get_match(self.file(), self.method())
    }

    fn matches(&self, filter: &NameFilter) -> bool {
        self.name_match(filter).is_some()
    }
}

impl fmt::Debug for dyn TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// How to invoke the test tool for one kind of unit.
#[derive(Clone)]
pub struct Invocation {
    /// Argument templates; `{file}`, `{method}`, `{log}` and `{output_dir}`
    /// are substituted per run.
    pub args: Vec<String>,
    pub parser: Arc<dyn ResultLogParser>,
}

impl Invocation {
    fn command(&self, base: &Command, output_dir: &Path, target: &Target<'_>, log: &Path) -> Command {
        let log = log.to_string_lossy();
        let output_dir = output_dir.to_string_lossy();
        let args = self.args.iter().map(|arg| {
            arg.replace("{file}", target.file)
                .replace("{method}", target.method.unwrap_or_default())
                .replace("{log}", &log)
                .replace("{output_dir}", &output_dir)
        });
        base.clone().args(args)
    }
}

/// Everything units need to launch the test tool.
pub struct UnitContext {
    pub launcher: Arc<dyn ProcessLauncher>,
    /// Tool program with its fixed leading arguments.
    pub tool: Command,
    pub single: Invocation,
    pub batch: Invocation,
    /// Appended to batch invocations running in fail-fast mode.
    pub batch_fail_fast_args: Vec<String>,
    /// Default fail-fast mode of whole batches.
    pub batch_fail_fast: bool,
    /// Where result artifacts are written.
    pub output_dir: PathBuf,
    pub idle_timeout: Option<Duration>,
}

impl UnitContext {
    /// Builds the context described by the `[tool]` and `[units]` settings.
    pub fn from_config(config: &Config, launcher: Arc<dyn ProcessLauncher>) -> ProviderResult<Self> {
        let parser = config.tool.log_format.parser();
        Ok(Self {
            launcher,
            tool: Command::parse(&config.tool.command)?,
            single: Invocation {
                args: config.tool.single_args.clone(),
                parser: Arc::clone(&parser),
            },
            batch: Invocation {
                args: config.tool.batch_args.clone(),
                parser,
            },
            batch_fail_fast_args: config.tool.batch_fail_fast_args.clone(),
            batch_fail_fast: config.units.batch_fail_fast,
            output_dir: config.report.output_dir.clone(),
            idle_timeout: config.splitrun.idle_timeout(),
        })
    }
}

pub(crate) struct Target<'a> {
    pub id: &'a str,
    pub file: &'a str,
    pub method: Option<&'a str>,
}

/// Run state of one process-backed unit.
///
/// Owns the result artifact: it is parsed and deleted as soon as the process
/// is seen finished, and deleted on drop otherwise.
#[derive(Default)]
pub(crate) struct Execution {
    handle: Option<Box<dyn ProcessHandle>>,
    artifact: Option<PathBuf>,
    records: Option<Vec<TestRecord>>,
    spawn_error: Option<String>,
    timed_out: bool,
    finished: bool,
    elapsed: Option<Duration>,
}

impl Execution {
    pub fn start(
        &mut self,
        ctx: &UnitContext,
        invocation: &Invocation,
        target: &Target<'_>,
        extra_args: &[String],
    ) {
        self.reset();

        let artifact = ctx.output_dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4().simple(),
            invocation.parser.extension()
        ));
        let cmd = invocation
            .command(&ctx.tool, &ctx.output_dir, target, &artifact)
            .args(extra_args.iter().cloned())
            .idle_timeout(ctx.idle_timeout);
        self.artifact = Some(artifact);

        match ctx.launcher.start(&cmd) {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                warn!("{}: {}", target.id, e);
                self.spawn_error = Some(e.to_string());
            }
        }
    }

    /// Polls the process; on the first observation of its end, parses the
    /// result artifact.
    pub fn poll(&mut self, invocation: &Invocation, target: &Target<'_>) -> bool {
        if self.finished {
            return false;
        }

        if let Some(handle) = self.handle.as_mut() {
            if handle.check_timeout().is_err() {
                self.timed_out = true;
            }
            if !self.timed_out && handle.is_running() {
                return true;
            }
            self.elapsed = Some(handle.elapsed());
        }

        self.finished = true;
        self.collect_records(invocation, target);
        false
    }

    fn collect_records(&mut self, invocation: &Invocation, target: &Target<'_>) {
        let Some(artifact) = self.artifact.take() else {
            return;
        };
        if self.spawn_error.is_some() {
            return;
        }

        match invocation.parser.parse(&artifact) {
            Ok(records) => self.records = Some(records),
            Err(e) => debug!("{}: {}", target.id, e),
        }
        remove_artifact(&artifact);
    }

    fn reset(&mut self) {
        if let Some(artifact) = self.artifact.take() {
            remove_artifact(&artifact);
        }
        *self = Self::default();
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some() || self.spawn_error.is_some()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Process exited with code 0 before any timeout.
    pub fn exited_ok(&self) -> bool {
        !self.timed_out && self.handle.as_ref().is_some_and(|handle| handle.is_successful())
    }

    /// Parsed records; `None` means the run is broken.
    pub fn records(&self) -> Option<&[TestRecord]> {
        self.records.as_deref()
    }

    pub fn output(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.output())
            .unwrap_or_default()
    }

    pub fn error_output(&self) -> String {
        match (&self.handle, &self.spawn_error) {
            (Some(handle), _) => handle.error_output(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        }
    }

    pub fn actual_duration(&self) -> Option<u64> {
        if !self.finished {
            return None;
        }
        Some(self.elapsed.map(|elapsed| elapsed.as_secs()).unwrap_or(0))
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if let Some(artifact) = self.artifact.take() {
            remove_artifact(&artifact);
        }
    }
}

fn remove_artifact(artifact: &Path) {
    if let Err(e) = std::fs::remove_file(artifact)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("Failed to remove {}: {}", artifact.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeLauncher, FakeRun, fake_context};
    use super::*;

    #[test]
    fn test_invocation_substitutes_placeholders() {
        let invocation = Invocation {
            args: vec![
                "run".into(),
                "{file}:^{method}$".into(),
                "--xml".into(),
                "{log}".into(),
                "-o".into(),
                "paths: output: {output_dir}".into(),
            ],
            parser: crate::report::LogFormat::Junit.parser(),
        };
        let target = Target {
            id: "tests/A.php:one",
            file: "tests/A.php",
            method: Some("one"),
        };

        let cmd = invocation.command(
            &Command::new("codecept"),
            Path::new("/out"),
            &target,
            Path::new("/out/x.xml"),
        );

        assert_eq!(cmd.program, "codecept");
        assert_eq!(
            cmd.args,
            vec!["run", "tests/A.php:^one$", "--xml", "/out/x.xml", "-o", "paths: output: /out"]
        );
    }

    #[tokio::test]
    async fn test_execution_parses_and_removes_artifact() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::records(&[("one", "pass", 2.0)])]);
        let (ctx, _dir) = fake_context(launcher.clone());
        let target = Target {
            id: "tests/A.php:one",
            file: "tests/A.php",
            method: Some("one"),
        };

        let mut exec = Execution::default();
        exec.start(&ctx, &ctx.single, &target, &[]);
        assert!(exec.is_started());
        assert_eq!(exec.actual_duration(), None);

        while exec.poll(&ctx.single, &target) {}

        let records = exec.records().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_passed());
        assert!(exec.exited_ok());
        assert_eq!(exec.actual_duration(), Some(2));
        assert_eq!(std::fs::read_dir(&ctx.output_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_execution_without_artifact_is_broken() {
        let launcher = FakeLauncher::new();
        launcher.script("tests/A.php:one", [FakeRun::broken("Fatal error")]);
        let (ctx, _dir) = fake_context(launcher);
        let target = Target {
            id: "tests/A.php:one",
            file: "tests/A.php",
            method: Some("one"),
        };

        let mut exec = Execution::default();
        exec.start(&ctx, &ctx.single, &target, &[]);
        while exec.poll(&ctx.single, &target) {}

        assert!(exec.records().is_none());
        assert_eq!(exec.error_output(), "Fatal error");
    }
}
