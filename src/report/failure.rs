//! Final failure report.
//!
//! Built once at the end of a run from every unit that is still failing. The
//! report is persisted as JSON next to the other run artifacts and rendered to
//! the console as a lexicographically sorted list of lines, so two runs with
//! the same failures produce identical, diffable output.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ReportError;

/// Console lines longer than this are cut.
const MAX_LINE_CHARS: usize = 96;
/// Characters kept from a cut line, before the ` ...` marker.
const KEPT_LINE_CHARS: usize = 92;

/// What kind of unit a failure record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// A single test method.
    Test,
    /// A whole test file.
    Batch,
}

/// One still-failing unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub name: String,
    pub message: String,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Console lines contributed by this record.
    ///
    /// A test contributes `name: <first message line>`; a batch contributes
    /// every line of its message, which already names the failed methods.
    fn console_lines(&self) -> Vec<String> {
        let mut lines = self.message.lines().map(trim_line);
        match self.kind {
            FailureKind::Test => match lines.next().filter(|line| !line.is_empty()) {
                Some(first) => vec![format!("{}: {}", self.name, first)],
                None => vec![self.name.clone()],
            },
            FailureKind::Batch => {
                let lines: Vec<String> = lines.collect();
                if lines.is_empty() {
                    vec![self.name.clone()]
                } else {
                    lines
                }
            }
        }
    }
}

fn trim_line(line: &str) -> String {
    if line.chars().count() > MAX_LINE_CHARS {
        let kept: String = line.chars().take(KEPT_LINE_CHARS).collect();
        format!("{kept} ...")
    } else {
        line.to_string()
    }
}

/// Ordered collection of failure records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureReport {
    records: Vec<FailureRecord>,
}

impl FailureReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Renders the console lines, sorted lexicographically.
    ///
    /// ```
    /// use splitrun::report::{FailureKind, FailureRecord, FailureReport};
    ///
    /// let mut report = FailureReport::new();
    /// report.push(FailureRecord::new(FailureKind::Test, "X:t2", "boom"));
    /// report.push(FailureRecord::new(FailureKind::Test, "A:t1", "zap"));
    ///
    /// assert_eq!(report.render_lines(), vec!["A:t1: zap", "X:t2: boom"]);
    /// ```
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .records
            .iter()
            .flat_map(FailureRecord::console_lines)
            .collect();
        lines.sort();
        lines
    }

    /// Prints the sorted lines under a header. Prints nothing when empty.
    pub fn print(&self) {
        if self.is_empty() {
            return;
        }
        println!();
        println!("{}", console::style("Following tests failed").red().bold());
        for line in self.render_lines() {
            println!("  {}", line);
        }
    }

    /// Writes the report as JSON to `<dir>/<run_id>_failures.json`.
    ///
    /// Returns `None` without touching the disk when there is nothing to report.
    pub fn save(&self, dir: &Path, run_id: &str) -> Result<Option<PathBuf>, ReportError> {
        self.save_to(&dir.join(format!("{run_id}_failures.json")))
    }

    /// Writes the report as JSON to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<Option<PathBuf>, ReportError> {
        if self.is_empty() {
            return Ok(None);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string(self).map_err(|e| ReportError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, encoded)?;
        Ok(Some(path.to_path_buf()))
    }
}
