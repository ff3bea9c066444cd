//! Result logs and the final failure report.
//!
//! Every finished subprocess leaves a result artifact on disk. A
//! [`ResultLogParser`] turns that artifact into [`TestRecord`]s. A missing or
//! unreadable artifact is reported as an error, which the caller treats as a
//! *broken* run, distinct from a run whose records say "fail".
//!
//! | Format | Module | Typical producer |
//! |--------|--------|------------------|
//! | `json` | [`json_log`] | event-stream loggers (`--json`) |
//! | `junit` | [`junit_log`] | JUnit XML reporters (`--xml`) |

pub mod failure;
pub mod json_log;
pub mod junit_log;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use failure::{FailureKind, FailureRecord, FailureReport};
pub use json_log::JsonLogParser;
pub use junit_log::JunitLogParser;

/// Outcome of a single test method as written by the test tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pass,
    Fail,
    Error,
    Skipped,
}

/// One test method result parsed from a result artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    /// Test name as the tool reports it, e.g. `LoginCest: Sign in`.
    pub name: String,
    pub status: RecordStatus,
    pub duration_secs: f64,
    pub message: String,
}

impl TestRecord {
    pub fn new(name: impl Into<String>, status: RecordStatus) -> Self {
        Self {
            name: name.into(),
            status,
            duration_secs: 0.0,
            message: String::new(),
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Method part of the name: the last space or colon separated token.
    ///
    /// ```
    /// use splitrun::report::{RecordStatus, TestRecord};
    ///
    /// let record = TestRecord::new("LoginCest: signIn", RecordStatus::Pass);
    /// assert_eq!(record.method(), "signIn");
    /// ```
    pub fn method(&self) -> &str {
        self.name
            .rsplit(|c: char| c.is_whitespace() || c == ':')
            .find(|part| !part.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn is_passed(&self) -> bool {
        self.status == RecordStatus::Pass
    }

    pub fn is_skipped(&self) -> bool {
        self.status == RecordStatus::Skipped
    }
}

/// Errors while reading a result artifact.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Result log not found: {0}")]
    Missing(PathBuf),

    #[error("Result log is empty: {0}")]
    Empty(PathBuf),

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses the result artifact of one finished subprocess.
pub trait ResultLogParser: Send + Sync {
    /// File extension used for artifacts of this format, without the dot.
    fn extension(&self) -> &'static str;

    /// Parses the records stored in `artifact`.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError`] when the artifact is absent, empty or malformed.
    fn parse(&self, artifact: &Path) -> Result<Vec<TestRecord>, ReportError>;
}

/// Supported result artifact formats.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Junit,
}

impl LogFormat {
    pub fn parser(self) -> Arc<dyn ResultLogParser> {
        match self {
            LogFormat::Json => Arc::new(JsonLogParser),
            LogFormat::Junit => Arc::new(JunitLogParser),
        }
    }
}

/// Reads an artifact, rejecting missing and empty files.
pub(crate) fn read_artifact(artifact: &Path) -> Result<String, ReportError> {
    let content = match std::fs::read_to_string(artifact) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ReportError::Missing(artifact.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Err(ReportError::Empty(artifact.to_path_buf()));
    }
    Ok(content)
}

/// Collapses every whitespace run into a single space and trims the ends.
///
/// ```
/// assert_eq!(splitrun::report::strip("  a\n\t b  "), "a b");
/// ```
pub fn strip(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_extraction() {
        assert_eq!(TestRecord::new("Cest: Test02", RecordStatus::Pass).method(), "Test02");
        assert_eq!(TestRecord::new("Cest:test", RecordStatus::Pass).method(), "test");
        assert_eq!(TestRecord::new("plain", RecordStatus::Pass).method(), "plain");
    }

    #[test]
    fn test_read_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(read_artifact(&missing), Err(ReportError::Missing(_))));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(matches!(read_artifact(&empty), Err(ReportError::Empty(_))));
    }

    #[test]
    fn test_strip_collapses_whitespace() {
        assert_eq!(strip("Failed asserting\n   that false\tis true."), "Failed asserting that false is true.");
        assert_eq!(strip(""), "");
    }

    #[test]
    fn test_log_format_parser_extension() {
        assert_eq!(LogFormat::Json.parser().extension(), "json");
        assert_eq!(LogFormat::Junit.parser().extension(), "xml");
    }
}
