//! JUnit XML result parser.
//!
//! Reads every `<testcase>` element with a streaming `quick-xml` reader:
//!
//! ```xml
//! <testsuite name="acceptance">
//!   <testcase name="signIn" classname="LoginCest" time="1.25"/>
//!   <testcase name="signOut" classname="LoginCest" time="0.40">
//!     <failure type="AssertionError">LoginCest: signOut
//!       Failed asserting that false is true.
//!     </failure>
//!   </testcase>
//! </testsuite>
//! ```
//!
//! A testcase without a `failure`, `error` or `skipped` child passed. The
//! failure message is the failure text without its first line (which repeats
//! the test name), up to the first blank line, joined into one line.

use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{RecordStatus, ReportError, ResultLogParser, TestRecord, read_artifact, strip};

/// Parser for JUnit XML result files.
#[derive(Debug, Default, Clone, Copy)]
pub struct JunitLogParser;

impl ResultLogParser for JunitLogParser {
    fn extension(&self) -> &'static str {
        "xml"
    }

    fn parse(&self, artifact: &Path) -> Result<Vec<TestRecord>, ReportError> {
        let content = read_artifact(artifact)?;
        parse_testcases(&content).map_err(|reason| ReportError::Parse {
            path: artifact.to_path_buf(),
            reason,
        })
    }
}

/// Testcase being assembled while its children are read.
struct OpenCase {
    record: TestRecord,
    /// Set while inside a failure/error element whose text is the message.
    capturing: bool,
    text: String,
}

fn parse_testcases(content: &str) -> Result<Vec<TestRecord>, String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(false);

    let mut records = Vec::new();
    let mut open: Option<OpenCase> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at position {}: {e}", reader.error_position()))?;

        match event {
            Event::Start(e) if e.name().as_ref() == b"testcase" => {
                open = Some(OpenCase {
                    record: testcase_record(&e)?,
                    capturing: false,
                    text: String::new(),
                });
            }
            Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                records.push(testcase_record(&e)?);
            }
            Event::Start(e) => {
                if let Some(case) = open.as_mut() {
                    record_verdict(case, &e, true);
                }
            }
            Event::Empty(e) => {
                if let Some(case) = open.as_mut() {
                    record_verdict(case, &e, false);
                }
            }
            Event::Text(text) => {
                if let Some(case) = open.as_mut().filter(|case| case.capturing) {
                    let text = text.unescape().map_err(|e| e.to_string())?;
                    case.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(case) = open.as_mut().filter(|case| case.capturing) {
                    case.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"failure" | b"error" => {
                    if let Some(case) = open.as_mut() {
                        case.capturing = false;
                    }
                }
                b"testcase" => {
                    if let Some(case) = open.take() {
                        let mut record = case.record;
                        record.message = failure_message(&case.text);
                        records.push(record);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(records)
}

/// Applies a `failure`/`error`/`skipped` child to the open testcase.
///
/// The first verdict wins.
fn record_verdict(case: &mut OpenCase, element: &BytesStart<'_>, has_body: bool) {
    let status = match element.name().as_ref() {
        b"failure" => RecordStatus::Fail,
        b"error" => RecordStatus::Error,
        b"skipped" => RecordStatus::Skipped,
        _ => return,
    };
    if case.record.status != RecordStatus::Pass {
        return;
    }
    case.record.status = status;
    case.capturing = has_body && status != RecordStatus::Skipped;
}

fn testcase_record(element: &BytesStart<'_>) -> Result<TestRecord, String> {
    let mut name = None;
    let mut time = 0.0;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        match attr.key.as_ref() {
            b"name" => name = Some(value.into_owned()),
            b"time" => time = value.trim().parse().unwrap_or(0.0),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| "testcase without a name attribute".to_string())?;
    Ok(TestRecord::new(name, RecordStatus::Pass).with_duration(time))
}

fn failure_message(text: &str) -> String {
    text.lines()
        .skip(1)
        .map(strip)
        .take_while(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
