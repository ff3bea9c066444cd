//! Test doubles for units and processes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BoxedUnit, Invocation, TestUnit, UnitContext, UnitKind};
use crate::provider::{Command, ProcessHandle, ProcessLauncher, ProviderError, ProviderResult};
use crate::report::LogFormat;

/// Ordered record of unit starts, shared between a unit and its copies.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Result of one scripted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass(u64),
    Fail,
    TimedOut,
    Skipped,
}

/// A unit that replays a script of outcomes, one per start.
///
/// Runs report "running" for exactly one poll. Once the script is exhausted
/// every further run passes in one second.
pub struct ScriptedUnit {
    id: String,
    kind: UnitKind,
    parent: Option<String>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    journal: Journal,
    current: Option<Outcome>,
    polls_left: usize,
    expected: Option<u64>,
    passes_some: bool,
}

impl ScriptedUnit {
    pub fn new(id: &str, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            id: id.to_string(),
            kind: UnitKind::Single,
            parent: None,
            script: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            journal: journal(),
            current: None,
            polls_left: 0,
            expected: None,
            passes_some: false,
        }
    }

    pub fn passing(id: &str) -> Self {
        Self::new(id, [])
    }

    pub fn with_kind(mut self, kind: UnitKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_expected(mut self, secs: u64) -> Self {
        self.expected = Some(secs);
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Arc::clone(journal);
        self
    }

    /// Batch units: report that some methods passed even when the run failed.
    pub fn passing_some(mut self) -> Self {
        self.passes_some = true;
        self
    }

    pub fn boxed(self) -> BoxedUnit {
        Box::new(self)
    }
}

impl TestUnit for ScriptedUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        self.kind
    }

    fn file(&self) -> &str {
        self.id.split_once(':').map_or(self.id.as_str(), |(file, _)| file)
    }

    fn method(&self) -> Option<&str> {
        self.id.split_once(':').map(|(_, method)| method)
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    fn start(&mut self) {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Pass(1));
        self.current = Some(outcome);
        self.polls_left = 1;
        self.journal.lock().unwrap().push(self.id.clone());
    }

    fn is_running(&mut self) -> bool {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return true;
        }
        false
    }

    fn is_timed_out(&self) -> bool {
        self.current == Some(Outcome::TimedOut)
    }

    fn is_successful(&self) -> bool {
        matches!(self.current, Some(Outcome::Pass(_)))
    }

    fn is_marked_skipped(&self) -> bool {
        self.current == Some(Outcome::Skipped)
    }

    fn status_description(&self) -> String {
        match self.current {
            Some(Outcome::Fail) => format!("{} failed", self.id),
            Some(Outcome::TimedOut) => "TIMEOUT".to_string(),
            _ => String::new(),
        }
    }

    fn output(&self) -> String {
        String::new()
    }

    fn error_output(&self) -> String {
        self.status_description()
    }

    fn expected_duration(&self) -> Option<u64> {
        self.expected
    }

    fn set_expected_duration(&mut self, secs: u64) {
        self.expected = Some(secs);
    }

    fn actual_duration(&self) -> Option<u64> {
        match self.current? {
            Outcome::Pass(secs) => Some(secs),
            _ => Some(0),
        }
    }

    fn has_passed_tests_this_run(&self) -> bool {
        self.is_successful() || self.passes_some
    }

    fn reset_for_rerun(&self) -> BoxedUnit {
        Box::new(Self {
            id: self.id.clone(),
            kind: self.kind,
            parent: self.parent.clone(),
            script: Arc::clone(&self.script),
            journal: Arc::clone(&self.journal),
            current: None,
            polls_left: 0,
            expected: self.expected,
            passes_some: self.passes_some,
        })
    }
}

/// Scripted process run for [`FakeLauncher`].
#[derive(Debug, Clone)]
pub struct FakeRun {
    /// `(name, status, seconds)` records written as a JSON event log.
    records: Option<Vec<(String, String, f64)>>,
    exit_ok: bool,
    stderr: String,
    polls: usize,
    hang: bool,
    elapsed: u64,
}

impl FakeRun {
    /// A run that writes the given records and exits 0 only if none failed.
    pub fn records(records: &[(&str, &str, f64)]) -> Self {
        let exit_ok = records
            .iter()
            .all(|(_, status, _)| *status == "pass" || *status == "skipped");
        let elapsed = records.iter().map(|(_, _, secs)| secs).sum::<f64>().ceil() as u64;
        Self {
            records: Some(
                records
                    .iter()
                    .map(|(name, status, secs)| (name.to_string(), status.to_string(), *secs))
                    .collect(),
            ),
            exit_ok,
            stderr: String::new(),
            polls: 1,
            hang: false,
            elapsed,
        }
    }

    /// A run that crashes without writing a result artifact.
    pub fn broken(stderr: &str) -> Self {
        Self {
            records: None,
            exit_ok: false,
            stderr: stderr.to_string(),
            polls: 1,
            hang: false,
            elapsed: 0,
        }
    }

    /// A run that trips the idle timeout.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::broken("")
        }
    }

    /// Trips the idle timeout while the handle still reports a clean exit.
    pub fn timing_out(mut self) -> Self {
        self.hang = true;
        self
    }

    fn log_json(&self) -> Option<String> {
        let events: Vec<serde_json::Value> = self
            .records
            .as_ref()?
            .iter()
            .map(|(name, status, secs)| {
                serde_json::json!({
                    "event": "test",
                    "test": name,
                    "status": status,
                    "time": secs,
                    "message": format!("{name} {status}"),
                })
            })
            .collect();
        Some(serde_json::Value::Array(events).to_string())
    }
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, VecDeque<FakeRun>>,
    started: Vec<String>,
}

/// Launcher that never spawns anything; it writes scripted result artifacts.
///
/// The first argument of a command is the run target (`file` or
/// `file:method`); the argument after `--log` is the artifact path. Targets
/// without a script pass with a single record.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, target: &str, runs: impl IntoIterator<Item = FakeRun>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(target.to_string())
            .or_default()
            .extend(runs);
    }

    /// Targets in start order.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn start(&self, cmd: &Command) -> ProviderResult<Box<dyn ProcessHandle>> {
        let target = cmd
            .args
            .first()
            .cloned()
            .ok_or_else(|| ProviderError::SpawnFailed("no target".to_string()))?;
        let log = cmd
            .args
            .iter()
            .skip_while(|arg| *arg != "--log")
            .nth(1)
            .cloned()
            .ok_or_else(|| ProviderError::SpawnFailed("no --log".to_string()))?;

        let run = {
            let mut state = self.state.lock().unwrap();
            state.started.push(target.clone());
            state
                .scripts
                .get_mut(&target)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| FakeRun::records(&[(target.as_str(), "pass", 1.0)]))
        };

        if let Some(json) = run.log_json() {
            std::fs::write(&log, json)?;
        }

        Ok(Box::new(FakeHandle { run }))
    }
}

struct FakeHandle {
    run: FakeRun,
}

impl ProcessHandle for FakeHandle {
    fn is_running(&mut self) -> bool {
        if self.run.polls > 0 {
            self.run.polls -= 1;
            return true;
        }
        false
    }

    fn check_timeout(&mut self) -> ProviderResult<()> {
        if self.run.hang {
            return Err(ProviderError::IdleTimeout(Duration::from_secs(1)));
        }
        Ok(())
    }

    fn is_successful(&self) -> bool {
        self.run.exit_ok
    }

    fn output(&self) -> String {
        String::new()
    }

    fn error_output(&self) -> String {
        self.run.stderr.clone()
    }

    fn incremental_output(&mut self) -> String {
        String::new()
    }

    fn elapsed(&self) -> Duration {
        Duration::from_secs(self.run.elapsed)
    }
}

/// A unit context backed by `launcher`, writing artifacts to a temp dir.
pub fn fake_context(launcher: FakeLauncher) -> (Arc<UnitContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = UnitContext {
        launcher: Arc::new(launcher),
        tool: Command::new("tool"),
        single: Invocation {
            args: vec!["{file}:{method}".into(), "--log".into(), "{log}".into()],
            parser: LogFormat::Json.parser(),
        },
        batch: Invocation {
            args: vec!["{file}".into(), "--log".into(), "{log}".into()],
            parser: LogFormat::Json.parser(),
        },
        batch_fail_fast_args: vec!["--fail-fast".into()],
        batch_fail_fast: false,
        output_dir: dir.path().to_path_buf(),
        idle_timeout: None,
    };
    (Arc::new(ctx), dir)
}
