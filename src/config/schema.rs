//! Configuration schema definitions for splitrun.
//!
//! This module defines all configuration types that can be deserialized from
//! `splitrun.toml`. Every field outside `[tool]` has a default, so a minimal
//! file names the process count and the test tool.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig          - Parallelism, reruns, pacing, timeouts
//! ├── ToolConfig         - Test tool command line and result log format
//! ├── UnitsConfig        - How discovered files become units, filters
//! ├── PhasesConfig       - Units pulled into the before/after phases
//! ├── StatisticsConfig   - Duration history (optional)
//! └── ReportConfig       - Output directory and failure report
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::report::LogFormat;

/// Root configuration structure for splitrun.
///
/// # TOML Structure
///
/// ```toml
/// [splitrun]
/// process_count = 8
/// rerun_count = 2
///
/// [tool]
/// command = "php vendor/bin/codecept run acceptance"
/// discover_command = "php bin/list-tests.php"
/// single_args = ["{file}:^{method}$", "--json", "{log}"]
/// batch_args = ["{file}", "--json", "{log}"]
///
/// [units]
/// batch_mode = "batch_rerun_failed"
///
/// [report]
/// output_dir = "splitrun-output"
/// ```
///
/// # Example
///
/// ```
/// use splitrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [splitrun]
///     process_count = 2
///
///     [tool]
///     command = "vendor/bin/codecept run"
///     discover_command = "cat tests.txt"
/// "#).unwrap();
/// assert_eq!(config.splitrun.rerun_count, 0);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Parallelism and rerun policy.
    pub splitrun: RunConfig,

    /// The external test tool.
    pub tool: ToolConfig,

    #[serde(default)]
    pub units: UnitsConfig,

    #[serde(default)]
    pub phases: PhasesConfig,

    /// Duration history; partitioning falls back to unit counts without it.
    #[serde(default)]
    pub statistics: Option<StatisticsConfig>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `process_count` | required |
/// | `rerun_count` | 0 |
/// | `continuous_rerun` | true |
/// | `delay_msec` | None (adaptive) |
/// | `adaptive_delay` | true |
/// | `max_rps` | 10 |
/// | `tick_interval_ms` | None (delay / 5) |
/// | `idle_timeout_secs` | None |
/// | `rerun_whole_series` | false |
/// | `serial_before_fails_run` | false |
/// | `fast_batch_rerun` | true |
/// | `show_first_fail` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Number of test tool processes running at the same time.
    pub process_count: usize,

    /// How many times a failed unit may be rerun.
    #[serde(default)]
    pub rerun_count: usize,

    /// Rerun failed units while the parallel phase is still running, instead
    /// of after it drained.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub continuous_rerun: bool,

    /// Minimum pause between two process starts, in milliseconds.
    ///
    /// Ignored when `adaptive_delay` is on.
    pub delay_msec: Option<u64>,

    /// Derive the start delay from `process_count` and `max_rps`.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub adaptive_delay: bool,

    /// Upper bound of process starts per second for the adaptive delay.
    ///
    /// Default: 10
    #[serde(default = "default_max_rps")]
    pub max_rps: u64,

    /// Pause between two scheduler sweeps, in milliseconds.
    ///
    /// Defaults to a fifth of the start delay, at least 1ms.
    pub tick_interval_ms: Option<u64>,

    /// Kill a unit's process when it prints nothing for this many seconds.
    pub idle_timeout_secs: Option<u64>,

    /// Rerun a whole serial phase when any of its units failed.
    #[serde(default)]
    pub rerun_whole_series: bool,

    /// Stop the run when the serial before phase failed.
    #[serde(default)]
    pub serial_before_fails_run: bool,

    /// Drop batches without any passed method from reruns and split failing
    /// adaptive batches into their methods.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub fast_batch_rerun: bool,

    /// Log the output of the first failure as soon as it is known.
    #[serde(default)]
    pub show_first_fail: bool,

    /// Working directory of the test tool and discovery command.
    pub working_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Start delay of a parallel phase.
    pub fn parallel_delay(&self) -> Duration {
        if self.adaptive_delay {
            let rps = self.process_count.min(self.max_rps as usize).max(1) as u64;
            return Duration::from_millis(1000 / rps);
        }
        Duration::from_millis(self.delay_msec.unwrap_or(0))
    }

    /// Start delay of a serial phase.
    pub fn serial_delay(&self) -> Duration {
        if self.adaptive_delay {
            return Duration::from_secs(1);
        }
        Duration::from_millis(self.delay_msec.unwrap_or(0))
    }

    /// Pause between sweeps for a given start delay.
    pub fn tick_interval(&self, delay: Duration) -> Duration {
        if let Some(ms) = self.tick_interval_ms {
            return Duration::from_millis(ms);
        }
        (delay / 5).max(Duration::from_millis(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_rps() -> u64 {
    10
}

/// The external test tool.
///
/// Argument templates are appended to `command`; these placeholders are
/// substituted per run:
///
/// | Placeholder | Value |
/// |-------------|-------|
/// | `{file}` | test file of the unit |
/// | `{method}` | method of a single-method unit |
/// | `{log}` | path of the result log the tool must write |
/// | `{output_dir}` | the report output directory |
///
/// # Example
///
/// ```toml
/// [tool]
/// command = "php vendor/bin/codecept run acceptance --no-colors"
/// discover_command = "php bin/list-tests.php acceptance"
/// single_args = ["{file}:^{method}$", "--xml", "{log}"]
/// batch_args = ["{file}", "--xml", "{log}"]
/// batch_fail_fast_args = ["--fail-fast"]
/// log_format = "junit"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    /// Tool command line, split like a shell would.
    pub command: String,

    /// Shell command printing one `file:method` per line.
    pub discover_command: String,

    #[serde(default = "default_single_args")]
    pub single_args: Vec<String>,

    #[serde(default = "default_batch_args")]
    pub batch_args: Vec<String>,

    /// Appended to batch runs in fail-fast mode.
    #[serde(default = "default_fail_fast_args")]
    pub batch_fail_fast_args: Vec<String>,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_single_args() -> Vec<String> {
    vec!["{file}:^{method}$".into(), "--json".into(), "{log}".into()]
}

fn default_batch_args() -> Vec<String> {
    vec!["{file}".into(), "--json".into(), "{log}".into()]
}

fn default_fail_fast_args() -> Vec<String> {
    vec!["--fail-fast".into()]
}

/// How a discovered test file is turned into units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// One unit per method.
    Tests,
    /// One unit per file, rerun as a whole.
    BatchRerunWhole,
    /// One unit per file; reruns cover only the failed methods.
    #[default]
    BatchRerunFailed,
}

/// Unit construction and filtering.
///
/// Every list holds name entries: `file:method`, `file`, or a directory.
///
/// # Example
///
/// ```toml
/// [units]
/// batch_mode = "batch_rerun_whole"
/// batch_fail_fast = false
/// dividable = ["tests/slow"]
/// skip_reruns = ["tests/PaymentCest.php"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitsConfig {
    #[serde(default)]
    pub batch_mode: BatchMode,

    /// Whole batches stop at the first failing method.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub batch_fail_fast: bool,

    /// Always split these files into one unit per method.
    #[serde(default)]
    pub dividable: Vec<String>,

    /// Always run these files as whole batches.
    #[serde(default)]
    pub not_dividable_rerun_whole: Vec<String>,

    /// Always run these files as adaptive batches.
    #[serde(default)]
    pub not_dividable_rerun_failed: Vec<String>,

    /// Load only the matching units.
    #[serde(default)]
    pub only_tests: Vec<String>,

    /// Never load the matching units.
    #[serde(default)]
    pub skip_tests: Vec<String>,

    /// Never rerun the matching units.
    #[serde(default)]
    pub skip_reruns: Vec<String>,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            batch_mode: BatchMode::default(),
            batch_fail_fast: true,
            dividable: Vec::new(),
            not_dividable_rerun_whole: Vec::new(),
            not_dividable_rerun_failed: Vec::new(),
            only_tests: Vec::new(),
            skip_tests: Vec::new(),
            skip_reruns: Vec::new(),
        }
    }
}

/// Units pulled out of the main parallel phase.
///
/// Serial phases run their units in the order of the matching entries.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PhasesConfig {
    #[serde(default)]
    pub run_before_series: Vec<String>,

    #[serde(default)]
    pub run_before_parallel: Vec<String>,

    #[serde(default)]
    pub run_after_parallel: Vec<String>,

    #[serde(default)]
    pub run_after_series: Vec<String>,
}

/// Duration history kept in a JSON file.
///
/// # Example
///
/// ```toml
/// [statistics]
/// path = "~/.cache/splitrun/durations.json"
/// project = "shop"
/// environment = "staging"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatisticsConfig {
    /// History file; `~` and environment variables are expanded.
    pub path: String,

    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub environment: String,
}

/// Where result logs and the failure report go.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Result logs of running units and the failure report.
    ///
    /// Default: `splitrun-output`
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Failure report path. Defaults to `<output_dir>/<run_id>_failures.json`.
    pub failures_file: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            failures_file: None,
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("splitrun-output")
}
