//! Process launching abstractions.
//!
//! Every test unit maps to one OS subprocess. The scheduler never blocks on
//! these processes: it starts them through a [`ProcessLauncher`] and then
//! polls the returned [`ProcessHandle`] once per scheduler tick.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ProcessLauncher                          │
//! │  start(Command) ──────────► ProcessHandle                    │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ProcessHandle                           │
//! │  is_running()        non-blocking liveness poll              │
//! │  check_timeout()     idle-timeout enforcement                │
//! │  is_successful()     exit code 0                             │
//! │  output() / error_output() / incremental_output()            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Launchers
//!
//! | Launcher | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Child processes on the local machine, driven by tokio |

pub mod local;

use std::time::Duration;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while launching or supervising a process.
///
/// A process that runs and exits non-zero is NOT an error; that is an
/// ordinary test failure and is surfaced through [`ProcessHandle::is_successful`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The process could not be spawned at all.
    #[error("Failed to start process: {0}")]
    SpawnFailed(String),

    /// The process produced no output for longer than its idle timeout.
    #[error("Process idle for more than {0:?}")]
    IdleTimeout(Duration),

    /// I/O error while talking to the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute as a subprocess.
///
/// # Example
///
/// ```
/// use splitrun::provider::Command;
///
/// let cmd = Command::new("vendor/bin/codecept")
///     .arg("run")
///     .args(["acceptance", "tests/LoginCest.php"])
///     .working_dir("/app")
///     .env("APP_ENV", "test");
///
/// assert_eq!(cmd.program, "vendor/bin/codecept");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<String>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,

    /// Maximum time without any output before the process is considered hung.
    pub idle_timeout: Option<Duration>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            idle_timeout: None,
        }
    }

    /// Parses a shell-style command line into a program and its arguments.
    ///
    /// ```
    /// use splitrun::provider::Command;
    ///
    /// let cmd = Command::parse("php vendor/bin/codecept run 'my suite'").unwrap();
    /// assert_eq!(cmd.program, "php");
    /// assert_eq!(cmd.args, vec!["vendor/bin/codecept", "run", "my suite"]);
    /// ```
    pub fn parse(command_line: &str) -> ProviderResult<Self> {
        let parts = shell_words::split(command_line)
            .map_err(|e| ProviderError::SpawnFailed(format!("{command_line}: {e}")))?;

        let mut parts = parts.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| ProviderError::SpawnFailed("empty command line".to_string()))?;

        Ok(Self::new(program).args(parts))
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Converts the command to a shell-executable string, for logging.
    ///
    /// ```
    /// use splitrun::provider::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// A running (or finished) subprocess.
///
/// All methods are non-blocking. Output is captured incrementally in the
/// background, so it is available while the process is still running.
pub trait ProcessHandle: Send {
    /// Polls process liveness without waiting.
    ///
    /// Returns `false` once the process exited and its output was drained.
    fn is_running(&mut self) -> bool;

    /// Checks the idle timeout.
    ///
    /// Returns [`ProviderError::IdleTimeout`] (and kills the process) once the
    /// process has been silent for longer than its idle timeout. Keeps
    /// returning the error on subsequent calls.
    fn check_timeout(&mut self) -> ProviderResult<()>;

    /// Returns `true` if the process exited with code 0.
    fn is_successful(&self) -> bool;

    /// Everything written to stdout so far.
    fn output(&self) -> String;

    /// Everything written to stderr so far.
    fn error_output(&self) -> String;

    /// Stdout written since the previous call.
    fn incremental_output(&mut self) -> String;

    /// Time from start to the last observed output (or exit).
    fn elapsed(&self) -> Duration;
}

/// Starts subprocesses.
pub trait ProcessLauncher: Send + Sync {
    /// Starts the command and returns a handle to poll it.
    ///
    /// # Errors
    ///
    /// - `ProviderError::SpawnFailed` - the process could not be created
    fn start(&self, cmd: &Command) -> ProviderResult<Box<dyn ProcessHandle>>;
}
