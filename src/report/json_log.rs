//! JSON event log parser.
//!
//! The log is a stream of event objects, either wrapped in a top-level array
//! or written back to back. Only `"event": "test"` entries are kept:
//!
//! ```json
//! {"event": "test", "test": ["LoginCest", "LoginCest: Sign in"],
//!  "status": "fail", "time": 1.25, "message": "Element not found",
//!  "trace": [{"function": "seeElement"}]}
//! ```
//!
//! An `error` whose first trace frame is `markTestSkipped` is reported as
//! skipped.

use std::path::Path;

use serde_json::Value;

use super::{RecordStatus, ReportError, ResultLogParser, TestRecord, read_artifact};

const SKIP_FUNCTION: &str = "markTestSkipped";

/// Parser for JSON event logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLogParser;

impl ResultLogParser for JsonLogParser {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn parse(&self, artifact: &Path) -> Result<Vec<TestRecord>, ReportError> {
        let content = read_artifact(artifact)?;
        parse_events(&content).map_err(|reason| ReportError::Parse {
            path: artifact.to_path_buf(),
            reason,
        })
    }
}

fn parse_events(content: &str) -> Result<Vec<TestRecord>, String> {
    let mut records = Vec::new();

    for value in serde_json::Deserializer::from_str(content).into_iter::<Value>() {
        match value.map_err(|e| e.to_string())? {
            Value::Array(events) => records.extend(events.iter().filter_map(parse_event)),
            event => records.extend(parse_event(&event)),
        }
    }

    Ok(records)
}

fn parse_event(event: &Value) -> Option<TestRecord> {
    if event.get("event").and_then(Value::as_str) != Some("test") {
        return None;
    }

    // the test field is either a plain name or [suite, name]
    let name = match event.get("test") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Array(parts)) => parts
            .get(1)
            .or_else(|| parts.last())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };

    let mut status = match event.get("status").and_then(Value::as_str) {
        Some("pass") => RecordStatus::Pass,
        Some("skipped") => RecordStatus::Skipped,
        Some("error") => RecordStatus::Error,
        _ => RecordStatus::Fail,
    };
    if status == RecordStatus::Error && first_trace_function(event) == Some(SKIP_FUNCTION) {
        status = RecordStatus::Skipped;
    }

    let record = TestRecord::new(name, status)
        .with_duration(event.get("time").and_then(Value::as_f64).unwrap_or(0.0))
        .with_message(event.get("message").and_then(Value::as_str).unwrap_or_default());
    Some(record)
}

fn first_trace_function(event: &Value) -> Option<&str> {
    event
        .get("trace")?
        .as_array()?
        .first()?
        .get("function")?
        .as_str()
}
