//! Test discovery and unit construction.
//!
//! Discovery is delegated to the test project: a shell command prints one
//! `file:method` per line, and [`CommandDiscovery`] groups the lines into
//! [`DiscoveredFile`]s. [`UnitLoader`] then turns every file into units:
//!
//! ```text
//!   discover_command ──► DiscoveredFile { file, methods }
//!                                │
//!                   skip_tests / only_tests
//!                                │
//!        ┌───────────────────────┼────────────────────────┐
//!        ▼                       ▼                        ▼
//!  dividable / tests      rerun_whole             rerun_failed (default)
//!  SingleTestUnit × n     WholeBatchUnit          ClusterTestUnit
//! ```
//!
//! Per-name overrides win over `batch_mode`, in the order `dividable`,
//! `not_dividable_rerun_whole`, `not_dividable_rerun_failed`.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{BatchMode, UnitsConfig};
use crate::filter::NameFilter;
use crate::unit::{BoxedUnit, UnitFactory};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The discovery command could not be run or exited unsuccessfully.
    #[error("Failed to discover tests: {0}")]
    DiscoveryFailed(String),

    /// A line of discovery output is not `file:method`.
    #[error("Malformed discovery line {line}: {text:?}")]
    Malformed { line: usize, text: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A test file and its methods, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub file: String,
    pub methods: Vec<String>,
}

impl DiscoveredFile {
    pub fn new(file: impl Into<String>, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            file: file.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }
}

/// Anything that can list the test files of a project.
#[async_trait]
pub trait UnitSource: Send + Sync {
    async fn discover(&self) -> DiscoveryResult<Vec<DiscoveredFile>>;
}

/// Discovery through a user-provided shell command.
pub struct CommandDiscovery {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandDiscovery {
    pub fn new(command: impl Into<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir,
        }
    }
}

#[async_trait]
impl UnitSource for CommandDiscovery {
    async fn discover(&self) -> DiscoveryResult<Vec<DiscoveredFile>> {
        // Run through the shell to support pipes, globs, etc.
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!("Discovering tests: {}", self.command);
        let output = cmd
            .output()
            .await
            .map_err(|e| DiscoveryError::DiscoveryFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DiscoveryError::DiscoveryFailed(format!(
                "Discovery command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let files = parse_discovery_output(&stdout)?;
        if files.is_empty() {
            warn!("No tests discovered by: {}", self.command);
        }
        Ok(files)
    }
}

/// Groups `file:method` lines by file, keeping first-seen order.
///
/// Blank lines and lines starting with `#` are ignored; a line without a
/// method names a file with no tests.
pub fn parse_discovery_output(output: &str) -> DiscoveryResult<Vec<DiscoveredFile>> {
    let mut files: Vec<DiscoveredFile> = Vec::new();

    for (idx, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (file, method) = match line.rsplit_once(':') {
            Some((file, method)) => (file.trim(), Some(method.trim())),
            None => (line, None),
        };
        if file.is_empty() || method.is_some_and(str::is_empty) {
            return Err(DiscoveryError::Malformed {
                line: idx + 1,
                text: line.to_string(),
            });
        }

        let entry = match files.iter().position(|f| f.file == file) {
            Some(pos) => &mut files[pos],
            None => {
                files.push(DiscoveredFile::new(file, Vec::<String>::new()));
                let last = files.len() - 1;
                &mut files[last]
            }
        };
        if let Some(method) = method
            && !entry.methods.iter().any(|m| m == method)
        {
            entry.methods.push(method.to_string());
        }
    }

    Ok(files)
}

/// How one file is wrapped into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrapping {
    Singles,
    WholeBatch,
    AdaptiveBatch,
}

/// Turns discovered files into units according to the `[units]` settings.
pub struct UnitLoader {
    factory: UnitFactory,
    batch_mode: BatchMode,
    dividable: NameFilter,
    rerun_whole: NameFilter,
    rerun_failed: NameFilter,
    only_tests: NameFilter,
    skip_tests: NameFilter,
}

impl UnitLoader {
    pub fn new(factory: UnitFactory, config: &UnitsConfig) -> Self {
        let only_tests = NameFilter::new(config.only_tests.iter().cloned());

        // a method named in only_tests can only be selected out of a divided file
        let mut dividable = config.dividable.clone();
        if config.batch_mode != BatchMode::Tests {
            dividable.extend(only_tests.test_files().map(str::to_string));
        }

        Self {
            factory,
            batch_mode: config.batch_mode,
            dividable: NameFilter::new(dividable),
            rerun_whole: NameFilter::new(config.not_dividable_rerun_whole.iter().cloned()),
            rerun_failed: NameFilter::new(config.not_dividable_rerun_failed.iter().cloned()),
            only_tests,
            skip_tests: NameFilter::new(config.skip_tests.iter().cloned()),
        }
    }

    /// Builds units for `files`, in discovery order.
    pub fn load(&self, files: &[DiscoveredFile]) -> Vec<BoxedUnit> {
        let mut units: Vec<BoxedUnit> = Vec::new();

        for discovered in files {
            let file = discovered.file.as_str();
            if self.skip_tests.matches(file, None) {
                debug!("{} -> skipped (in skip_tests)", file);
                continue;
            }
            if discovered.methods.is_empty() {
                info!("No tests found in: {}", file);
                continue;
            }

            match self.wrapping(file) {
                Wrapping::Singles => {
                    for method in &discovered.methods {
                        if self.skip_tests.matches(file, Some(method)) {
                            debug!("{}:{} -> skipped (in skip_tests)", file, method);
                            continue;
                        }
                        units.push(Box::new(self.factory.single(file, method)));
                    }
                }
                Wrapping::WholeBatch => units.push(Box::new(self.factory.whole_batch(file))),
                Wrapping::AdaptiveBatch => units.push(Box::new(self.factory.adaptive_batch(file))),
            }
        }

        if !self.only_tests.is_empty() {
            units.retain(|unit| unit.matches(&self.only_tests));
        }

        debug!("{} units loaded from {} files", units.len(), files.len());
        units
    }

    fn wrapping(&self, file: &str) -> Wrapping {
        if self.dividable.matches(file, None) {
            return Wrapping::Singles;
        }
        if self.rerun_whole.matches(file, None) {
            return Wrapping::WholeBatch;
        }
        if self.rerun_failed.matches(file, None) {
            return Wrapping::AdaptiveBatch;
        }
        match self.batch_mode {
            BatchMode::Tests => Wrapping::Singles,
            BatchMode::BatchRerunWhole => Wrapping::WholeBatch,
            BatchMode::BatchRerunFailed => Wrapping::AdaptiveBatch,
        }
    }
}
