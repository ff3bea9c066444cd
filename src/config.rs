//! Configuration loading and schema definitions for splitrun.
//!
//! This module provides types and functions for loading splitrun configuration
//! from TOML files or strings. The configuration schema defines the run
//! policy, the test tool, unit construction and reporting.
//!
//! # The Configuration File Format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Loads splitrun configuration from a TOML file.
///
/// This is the primary way to load configuration. The file must be valid TOML,
/// conform to the splitrun configuration schema and pass [`validate`].
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - A setting is out of range
///
/// # Example
///
/// ```no_run
/// use splitrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("splitrun.toml"))?;
/// println!("Processes: {}", config.splitrun.process_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Loads splitrun configuration from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Example
///
/// ```
/// use splitrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [splitrun]
///     process_count = 4
///
///     [tool]
///     command = "vendor/bin/codecept run"
///     discover_command = "cat tests.txt"
/// "#)?;
///
/// assert_eq!(config.splitrun.process_count, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    validate(&config)?;
    Ok(config)
}

/// Rejects settings the scheduler cannot work with.
pub fn validate(config: &Config) -> Result<()> {
    if config.splitrun.process_count == 0 {
        bail!("splitrun.process_count must be at least 1");
    }
    if config.splitrun.adaptive_delay && config.splitrun.max_rps == 0 {
        bail!("splitrun.max_rps must be at least 1 when adaptive_delay is on");
    }
    if shell_words::split(&config.tool.command)
        .context("tool.command is not a valid command line")?
        .is_empty()
    {
        bail!("tool.command must not be empty");
    }
    if config.tool.discover_command.trim().is_empty() {
        bail!("tool.discover_command must not be empty");
    }
    Ok(())
}

/// Expands `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(raw).with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Starter configuration written by `splitrun init`.
pub const TEMPLATE: &str = r#"[splitrun]
process_count = 4
rerun_count = 1
continuous_rerun = true
adaptive_delay = true
max_rps = 10
# idle_timeout_secs = 600

[tool]
command = "php vendor/bin/codecept run acceptance --no-colors"
discover_command = "php bin/list-tests.php acceptance"
single_args = ["{file}:^{method}$", "--json", "{log}"]
batch_args = ["{file}", "--json", "{log}"]
batch_fail_fast_args = ["--fail-fast"]
log_format = "json"

[units]
batch_mode = "batch_rerun_failed"
batch_fail_fast = true
# dividable = ["tests/acceptance/Slow"]
# skip_reruns = ["tests/acceptance/PaymentCest.php"]

[phases]
# run_before_series = ["tests/acceptance/InstallCest.php"]

# [statistics]
# path = "~/.cache/splitrun/durations.json"
# project = "shop"
# environment = "ci"

[report]
output_dir = "splitrun-output"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [splitrun]
        process_count = 3

        [tool]
        command = "vendor/bin/codecept run"
        discover_command = "cat tests.txt"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config_str(MINIMAL).unwrap();

        assert_eq!(config.splitrun.process_count, 3);
        assert_eq!(config.splitrun.rerun_count, 0);
        assert!(config.splitrun.continuous_rerun);
        assert!(config.splitrun.adaptive_delay);
        assert!(config.splitrun.fast_batch_rerun);
        assert_eq!(config.splitrun.max_rps, 10);
        assert_eq!(config.units.batch_mode, BatchMode::BatchRerunFailed);
        assert!(config.units.batch_fail_fast);
        assert_eq!(config.tool.log_format, crate::report::LogFormat::Json);
        assert_eq!(config.report.output_dir, PathBuf::from("splitrun-output"));
        assert!(config.statistics.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = load_config_str(
            r#"
            [splitrun]
            process_count = 8
            rerun_count = 2
            continuous_rerun = false
            adaptive_delay = false
            delay_msec = 250
            idle_timeout_secs = 30

            [tool]
            command = "php codecept.phar run"
            discover_command = "php list.php"
            log_format = "junit"

            [units]
            batch_mode = "tests"
            dividable = ["tests/Slow"]
            skip_reruns = ["tests/A.php:flaky"]

            [phases]
            run_before_series = ["tests/Install.php"]

            [statistics]
            path = "durations.json"
            project = "shop"

            [report]
            output_dir = "out"
            failures_file = "out/failures.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.units.batch_mode, BatchMode::Tests);
        assert_eq!(config.tool.log_format, crate::report::LogFormat::Junit);
        assert_eq!(config.phases.run_before_series, vec!["tests/Install.php"]);
        assert_eq!(config.statistics.unwrap().environment, "");
        assert_eq!(
            config.report.failures_file,
            Some(PathBuf::from("out/failures.json"))
        );
        assert_eq!(
            config.splitrun.parallel_delay(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            config.splitrun.idle_timeout(),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_adaptive_delays() {
        let mut config = load_config_str(MINIMAL).unwrap().splitrun;
        assert_eq!(config.parallel_delay().as_millis(), 333);
        assert_eq!(config.serial_delay().as_millis(), 1000);
        assert_eq!(config.tick_interval(config.parallel_delay()).as_millis(), 66);

        config.process_count = 40;
        assert_eq!(config.parallel_delay().as_millis(), 100);

        config.tick_interval_ms = Some(7);
        assert_eq!(config.tick_interval(config.parallel_delay()).as_millis(), 7);

        config.adaptive_delay = false;
        config.tick_interval_ms = None;
        assert_eq!(config.parallel_delay().as_millis(), 0);
        assert_eq!(config.tick_interval(config.parallel_delay()).as_millis(), 1);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let zero = MINIMAL.replace("process_count = 3", "process_count = 0");
        let err = load_config_str(&zero).unwrap_err();
        assert!(err.to_string().contains("process_count"));

        let blank = MINIMAL.replace("vendor/bin/codecept run", "  ");
        assert!(load_config_str(&blank).is_err());

        let unbalanced = MINIMAL.replace("vendor/bin/codecept run", "run 'oops");
        assert!(load_config_str(&unbalanced).is_err());

        assert!(load_config_str("[splitrun]\nprocess_count = 1\n").is_err());
    }

    #[test]
    fn test_unknown_batch_mode_is_rejected() {
        let config = format!("{}\n[units]\nbatch_mode = \"sometimes\"\n", MINIMAL);
        assert!(load_config_str(&config).is_err());
    }

    #[test]
    fn test_template_is_valid() {
        let config = load_config_str(TEMPLATE).unwrap();
        assert_eq!(config.splitrun.rerun_count, 1);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splitrun.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        assert_eq!(load_config(&path).unwrap().splitrun.process_count, 3);
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("plain/path").unwrap(), PathBuf::from("plain/path"));
        assert!(expand_path("$SPLITRUN_SURELY_UNSET_VAR/x").is_err());
    }
}
