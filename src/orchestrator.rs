//! Run orchestration.
//!
//! This module coordinates a whole run: it routes units into phases, splits
//! parallel phases into lanes, hands the lanes to a [`RunnersSupervisor`],
//! reruns failures and finally reports every unit that never passed.
//!
//! # Architecture
//!
//! ```text
//!   Vec<BoxedUnit>
//!        │ fetch expected durations (statistics)
//!        ▼
//!   PhasedUnits::assign
//!        │
//!        ├─► Before Serial ────► one lane, non-continuous, rerun_count times
//!        ├─► Before Parallel ─┐
//!        ├─► Main Parallel ───┼─► partition ─► RunnersSupervisor
//!        ├─► After Parallel ──┘   (continuous: supervisor reruns on its own)
//!        └─► After Serial ─────► one lane, non-continuous
//!                                      │
//!                 passed durations ────┴──► statistics
//!                 still failing ──────────► FailureReport
//! ```
//!
//! # Key Components
//!
//! - [`Orchestrator`]: Main entry point coordinating the run
//! - [`partitioner`]: Splits a phase into duration-balanced lanes
//! - [`RunnersSupervisor`]: Drives the lanes of one phase run
//! - [`Runner`]: Executes the units of one lane, one at a time
//! - [`Delayer`]: Rate-limits process starts across all lanes
//! - [`RunResult`]: Outcome of the entire run
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use splitrun::config::load_config;
//! use splitrun::discovery::{CommandDiscovery, UnitLoader, UnitSource};
//! use splitrun::orchestrator::{Delayer, Orchestrator};
//! use splitrun::provider::local::LocalLauncher;
//! use splitrun::unit::{UnitContext, UnitFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("splitrun.toml"))?;
//!     let delayer = Delayer::new(config.splitrun.parallel_delay());
//!     let ctx = UnitContext::from_config(&config, Arc::new(LocalLauncher::default()))?;
//!     let factory = UnitFactory::new(Arc::new(ctx), delayer.clone());
//!
//!     let files = CommandDiscovery::new(&config.tool.discover_command, None).discover().await?;
//!     let units = UnitLoader::new(factory, &config.units).load(&files);
//!
//!     let result = Orchestrator::new(config, delayer).run(units).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod delayer;
pub mod partitioner;
pub mod phases;
pub mod retry;
pub mod runner;
pub mod supervisor;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::filter::NameFilter;
use crate::report::{FailureKind, FailureRecord, FailureReport, ReportError};
use crate::statistics::StatisticsBackend;
use crate::unit::{BoxedUnit, UnitKind};

pub use delayer::Delayer;
pub use partitioner::{DurationStats, Partition, PartitionError};
pub use phases::{Phase, PhasedUnits};
pub use retry::RerunLedger;
pub use runner::Runner;
pub use supervisor::{RunnersSupervisor, SupervisorOutcome, SupervisorSettings};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The serial before phase failed and the run was configured to stop.
    #[error("Serial before phase failed for {failed} unit(s), stopping the run")]
    SerialBeforeFailed {
        failed: usize,
        report_path: Option<PathBuf>,
    },

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("Failed to save the failure report: {0}")]
    Report(#[from] ReportError),
}

/// Outcome of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every unit passed, possibly after reruns |
/// | 1 | Some units failed or timed out |
#[derive(Debug)]
pub struct RunResult {
    /// UUID of this run; names the default failure report file.
    pub run_id: String,

    /// Units handed to the run.
    pub total_units: usize,

    /// Units that never passed.
    pub failed: usize,

    pub failures: FailureReport,

    /// Where the failure report was written, if anything failed.
    pub report_path: Option<PathBuf>,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Prints the counts of the run.
    pub fn print_summary(&self) {
        println!();
        println!("Units:   {}", self.total_units);
        println!(
            "Passed:  {}",
            console::style(self.total_units.saturating_sub(self.failed)).green()
        );
        println!("Failed:  {}", console::style(self.failed).red());
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!();

        if self.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
            if let Some(path) = &self.report_path {
                println!("Failure report: {}", path.display());
            }
        }
    }
}

/// The five-phase run coordinator.
///
/// The [`Delayer`] must be the one shared with the unit factory, so that the
/// inner lanes of adaptive batches draw from the same start budget.
pub struct Orchestrator {
    config: Config,
    delayer: Delayer,
    statistics: Option<Box<dyn StatisticsBackend>>,
    skip_reruns: NameFilter,
    show_progress: bool,

    durations_fetched: bool,
    /// Units whose expected duration came from statistics.
    known_durations: HashSet<String>,
    first_fail: Option<String>,
}

impl Orchestrator {
    pub fn new(config: Config, delayer: Delayer) -> Self {
        let skip_reruns = NameFilter::new(config.units.skip_reruns.iter().cloned());
        Self {
            config,
            delayer,
            statistics: None,
            skip_reruns,
            show_progress: false,
            durations_fetched: false,
            known_durations: HashSet::new(),
            first_fail: None,
        }
    }

    pub fn with_statistics(mut self, statistics: Option<Box<dyn StatisticsBackend>>) -> Self {
        self.statistics = statistics;
        self
    }

    /// Shows one progress bar per phase.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Runs `units` through all phases and reports what never passed.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::SerialBeforeFailed`] when the serial before
    /// phase failed and `serial_before_fails_run` is set; the failure report is
    /// written before returning. Failing tests are never an error.
    pub async fn run(&mut self, mut units: Vec<BoxedUnit>) -> Result<RunResult, OrchestratorError> {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let total_units = units.len();
        info!("Run {}: {} unit(s)", run_id, total_units);

        if let Err(e) = std::fs::create_dir_all(&self.config.report.output_dir) {
            warn!(
                "Failed to create output directory {}: {}",
                self.config.report.output_dir.display(),
                e
            );
        }

        self.fetch_expected_durations(&mut units).await;

        let mut phased = PhasedUnits::assign(units, &self.config.phases);
        let run_count = 1 + self.config.splitrun.rerun_count;
        let mut failing = Vec::new();

        let before = self
            .run_in_series(Phase::BeforeSeries, phased.take(Phase::BeforeSeries), run_count)
            .await;
        if self.config.splitrun.serial_before_fails_run && !before.is_empty() {
            let failed = before.len();
            let (_, report_path) = self.process_failing(&run_id, before).await?;
            return Err(OrchestratorError::SerialBeforeFailed {
                failed,
                report_path,
            });
        }
        failing.extend(before);

        for phase in [Phase::BeforeParallel, Phase::Main, Phase::AfterParallel] {
            let units = phased.take(phase);
            failing.extend(self.run_in_parallel(phase, units, run_count).await?);
        }

        failing.extend(
            self.run_in_series(Phase::AfterSeries, phased.take(Phase::AfterSeries), run_count)
                .await,
        );

        let failed = failing.len();
        let (failures, report_path) = self.process_failing(&run_id, failing).await?;

        Ok(RunResult {
            run_id,
            total_units,
            failed,
            failures,
            report_path,
            duration: start.elapsed(),
        })
    }

    async fn run_in_parallel(
        &mut self,
        phase: Phase,
        mut units: Vec<BoxedUnit>,
        run_count: usize,
    ) -> Result<Vec<BoxedUnit>, OrchestratorError> {
        if units.is_empty() {
            return Ok(units);
        }
        info!("{}: {} unit(s)", phase, units.len());

        let continuous = self.config.splitrun.continuous_rerun;
        // the supervisor reruns on its own in continuous mode
        let run_count = if continuous { 1 } else { run_count };
        let progress = self.progress_bar(units.len());
        let mut no_rerun = Vec::new();

        for i in 0..run_count {
            if units.is_empty() {
                debug!("No more units to run in {}", phase);
                break;
            }
            if continuous {
                debug!("Run continuous");
            } else {
                debug!("Run {} of {}", i + 1, run_count);
            }

            let delay = self.config.splitrun.parallel_delay();
            self.delayer.set_interval(delay);
            debug!("Start delay is {:?}", delay);

            let partition = self.partition(units)?;
            announce_end(partition.max_run_duration);

            let outcome = self
                .supervisor(partition.lanes, continuous, delay, progress.clone())
                .run()
                .await;
            units = self.collect(outcome, &mut no_rerun).await;
        }

        if let Some(progress) = progress {
            progress.finish();
        }
        units.extend(no_rerun);
        Ok(units)
    }

    async fn run_in_series(
        &mut self,
        phase: Phase,
        mut units: Vec<BoxedUnit>,
        run_count: usize,
    ) -> Vec<BoxedUnit> {
        if units.is_empty() {
            return units;
        }
        info!("{}: {} unit(s)", phase, units.len());

        let progress = self.progress_bar(units.len());
        let mut no_rerun = Vec::new();

        for i in 0..run_count {
            if units.is_empty() {
                debug!("No more units to run in {}", phase);
                break;
            }
            debug!("Run {} of {}", i + 1, run_count);

            let fresh: Option<Vec<BoxedUnit>> = self
                .config
                .splitrun
                .rerun_whole_series
                .then(|| units.iter().map(|unit| unit.reset_for_rerun()).collect());

            let delay = self.config.splitrun.serial_delay();
            self.delayer.set_interval(delay);

            let mut lap_no_rerun = Vec::new();
            let outcome = self
                .supervisor(vec![units], false, delay, progress.clone())
                .run()
                .await;
            units = self.collect(outcome, &mut lap_no_rerun).await;

            match fresh {
                Some(fresh) if !units.is_empty() && i + 1 < run_count => {
                    debug!("Rerunning the whole series");
                    units = fresh;
                }
                _ => no_rerun.extend(lap_no_rerun),
            }
        }

        if let Some(progress) = progress {
            progress.finish();
        }
        units.extend(no_rerun);
        units
    }

    fn supervisor(
        &self,
        lanes: Vec<Vec<BoxedUnit>>,
        continuous: bool,
        delay: Duration,
        progress: Option<ProgressBar>,
    ) -> RunnersSupervisor {
        let run = &self.config.splitrun;
        let settings = SupervisorSettings {
            rerun_count: run.rerun_count,
            continuous,
            fast_batch_rerun: run.fast_batch_rerun,
            show_first_fail: run.show_first_fail && self.first_fail.is_none(),
            tick: run.tick_interval(delay),
        };

        RunnersSupervisor::new(settings, self.delayer.clone(), lanes)
            .with_skip_reruns(self.skip_reruns.clone())
            .with_progress(progress)
    }

    /// Books a finished supervisor run; returns the units that may be rerun.
    async fn collect(
        &mut self,
        outcome: SupervisorOutcome,
        no_rerun: &mut Vec<BoxedUnit>,
    ) -> Vec<BoxedUnit> {
        if self.first_fail.is_none() {
            self.first_fail = outcome.first_fail;
        }
        self.send_durations(&outcome.passed_durations).await;

        if !outcome.marked_skipped.is_empty() {
            debug!("{} unit(s) marked skipped", outcome.marked_skipped.len());
        }
        no_rerun.extend(outcome.failed_no_rerun);
        no_rerun.extend(outcome.timed_out);
        outcome.failed
    }

    fn partition(&self, units: Vec<BoxedUnit>) -> Result<Partition, PartitionError> {
        let process_count = self.config.splitrun.process_count;
        let k = partitioner::lane_count(process_count, units.len());
        debug!("{} unit(s) will be partitioned in {} lane(s)", units.len(), k);

        if self.durations_fetched && units.len() > process_count {
            let partition = partitioner::by_duration(units, k)?;
            if let Some(stats) = partition.stats {
                debug!(
                    "Expected durations: min {}s, median {}s, max {}s",
                    stats.min, stats.median, stats.max
                );
            }
            return Ok(partition);
        }
        Ok(partitioner::by_count(units, k))
    }

    fn progress_bar(&self, len: usize) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    }

    async fn fetch_expected_durations(&mut self, units: &mut [BoxedUnit]) {
        let Some(statistics) = &self.statistics else {
            return;
        };

        let ids: Vec<String> = units.iter().map(|unit| unit.id().to_string()).collect();
        match statistics.fetch_expected_durations(&ids).await {
            Ok(durations) => {
                for unit in units.iter_mut() {
                    if let Some(&secs) = durations.get(unit.id()) {
                        unit.set_expected_duration(secs);
                    }
                }
                debug!("Expected durations known for {} of {} unit(s)", durations.len(), ids.len());
                self.known_durations = durations.into_keys().collect();
                self.durations_fetched = true;
            }
            Err(e) => warn!("Can't get unit durations: {}", e),
        }
    }

    async fn send_durations(&self, durations: &BTreeMap<String, u64>) {
        let Some(statistics) = &self.statistics else {
            return;
        };
        if durations.is_empty() {
            return;
        }
        if let Err(e) = statistics.send_actual_durations(durations).await {
            warn!("Can't send unit durations: {}", e);
        }
    }

    async fn process_failing(
        &self,
        run_id: &str,
        failing: Vec<BoxedUnit>,
    ) -> Result<(FailureReport, Option<PathBuf>), OrchestratorError> {
        let mut report = FailureReport::new();
        for unit in &failing {
            let kind = match unit.kind() {
                UnitKind::Single => FailureKind::Test,
                UnitKind::WholeBatch | UnitKind::AdaptiveBatch => FailureKind::Batch,
            };
            report.push(FailureRecord::new(kind, unit.id(), unit.status_description()));
        }

        report.print();
        let path = match &self.config.report.failures_file {
            Some(path) => report.save_to(path)?,
            None => report.save(&self.config.report.output_dir, run_id)?,
        };

        // better to know something about a never passing unit than nothing
        let never_passed: BTreeMap<String, u64> = failing
            .iter()
            .filter(|unit| !self.known_durations.contains(unit.id()))
            .filter_map(|unit| Some((unit.id().to_string(), unit.actual_duration()?)))
            .collect();
        self.send_durations(&never_passed).await;

        Ok((report, path))
    }
}

/// Logs the expected end of a lane set that takes `secs` seconds.
fn announce_end(secs: u64) {
    if secs == 0 {
        return;
    }
    let Some(span) = chrono::TimeDelta::try_seconds(secs as i64) else {
        return;
    };
    let end = chrono::Local::now() + span;
    info!(
        "Tests will end approximately at {}",
        end.format("%A, %d-%b-%Y %H:%M:%S %Z")
    );
}
