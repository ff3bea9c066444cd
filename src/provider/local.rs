//! Local process launcher.
//!
//! Runs every command as a child process of splitrun itself, through the
//! configured shell. Output of both streams is collected by background reader
//! tasks, so the scheduler can poll processes without ever blocking on a pipe.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Streaming output | Supported |
//! | Idle timeout | Supported, process is killed |
//! | Parallel execution | Yes, one child per running unit |
//!
//! # Example Configuration
//!
//! ```toml
//! [tool]
//! command = "vendor/bin/codecept run acceptance"
//! working_dir = "/path/to/project"
//! shell = "/bin/bash"
//!
//! [tool.env]
//! APP_ENV = "test"
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

use super::{Command, ProcessHandle, ProcessLauncher, ProviderError, ProviderResult};

/// How long to keep draining pipes after the child exited.
///
/// Grandchildren that inherited the pipes can keep them open forever.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Launcher that runs commands as local child processes.
///
/// The launcher is cheap to share; wrap it in an `Arc` and hand it to every
/// unit that needs to start a process.
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    shell: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl LocalLauncher {
    /// Creates a launcher that runs commands through `shell -c`.
    ///
    /// # Example
    ///
    /// ```
    /// use splitrun::provider::local::LocalLauncher;
    ///
    /// let launcher = LocalLauncher::new("/bin/bash")
    ///     .with_working_dir(Some("/app".into()))
    ///     .with_env(vec![("APP_ENV".into(), "test".into())]);
    /// ```
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ..Self::default()
        }
    }

    /// Directory every command runs in unless the command overrides it.
    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Environment applied to every command before its own variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

impl ProcessLauncher for LocalLauncher {
    fn start(&self, cmd: &Command) -> ProviderResult<Box<dyn ProcessHandle>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ProviderError::SpawnFailed(
                "no tokio runtime available".to_string(),
            ));
        }

        let shell_cmd = cmd.to_shell_string();
        debug!("Starting: {}", shell_cmd);

        // exec so that killing the child kills the test tool, not just the shell
        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(format!("exec {shell_cmd}"));

        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in self.env.iter().chain(cmd.env.iter()) {
            process.env(key, value);
        }

        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| ProviderError::SpawnFailed(format!("{shell_cmd}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::SpawnFailed("stderr not captured".to_string()))?;

        let output = Arc::new(Mutex::new(CapturedOutput {
            open_streams: 2,
            ..CapturedOutput::default()
        }));
        spawn_reader(stdout, Arc::clone(&output), Stream::Stdout);
        spawn_reader(stderr, Arc::clone(&output), Stream::Stderr);

        Ok(Box::new(LocalProcess {
            child,
            output,
            started: Instant::now(),
            finished: None,
            status: None,
            idle_timeout: cmd.idle_timeout,
            timed_out: false,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
    stdout_consumed: usize,
    last_output: Option<Instant>,
    open_streams: usize,
}

type SharedOutput = Arc<Mutex<CapturedOutput>>;

fn with_output<R>(output: &SharedOutput, f: impl FnOnce(&mut CapturedOutput) -> R) -> R {
    let mut guard = output.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

fn spawn_reader<R>(reader: R, output: SharedOutput, stream: Stream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Tools print whatever encoding they like; never stop draining on bad UTF-8.
        let mut lines = SplitStream::new(BufReader::new(reader).split(b'\n'));
        while let Some(line) = lines.next().await {
            let mut line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("Stopped reading {:?}: {}", stream, e);
                    break;
                }
            };
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            with_output(&output, |captured| {
                let buffer = match stream {
                    Stream::Stdout => &mut captured.stdout,
                    Stream::Stderr => &mut captured.stderr,
                };
                buffer.push_str(&line);
                buffer.push('\n');
                captured.last_output = Some(Instant::now());
            });
        }
        with_output(&output, |captured| {
            captured.open_streams = captured.open_streams.saturating_sub(1);
        });
    });
}

/// Handle to a local child process.
pub struct LocalProcess {
    child: tokio::process::Child,
    output: SharedOutput,
    started: Instant,
    finished: Option<Instant>,
    status: Option<ExitStatus>,
    idle_timeout: Option<Duration>,
    timed_out: bool,
}

impl ProcessHandle for LocalProcess {
    fn is_running(&mut self) -> bool {
        if self.finished.is_none() {
            match self.child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => self.status = Some(status),
                Err(e) => warn!("Failed to poll child process: {}", e),
            }
            self.finished = Some(Instant::now());
        }

        let draining = with_output(&self.output, |captured| captured.open_streams > 0);
        draining
            && self
                .finished
                .is_some_and(|finished| finished.elapsed() < DRAIN_GRACE)
    }

    fn check_timeout(&mut self) -> ProviderResult<()> {
        let Some(limit) = self.idle_timeout else {
            return Ok(());
        };
        if self.timed_out {
            return Err(ProviderError::IdleTimeout(limit));
        }
        if self.finished.is_some() {
            return Ok(());
        }

        let last = with_output(&self.output, |captured| captured.last_output)
            .unwrap_or(self.started);
        if last.elapsed() > limit {
            self.timed_out = true;
            if let Err(e) = self.child.start_kill() {
                warn!("Failed to kill idle process: {}", e);
            }
            return Err(ProviderError::IdleTimeout(limit));
        }
        Ok(())
    }

    fn is_successful(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|status| status.success())
    }

    fn output(&self) -> String {
        with_output(&self.output, |captured| captured.stdout.clone())
    }

    fn error_output(&self) -> String {
        with_output(&self.output, |captured| captured.stderr.clone())
    }

    fn incremental_output(&mut self) -> String {
        with_output(&self.output, |captured| {
            let fresh = captured.stdout[captured.stdout_consumed..].to_string();
            captured.stdout_consumed = captured.stdout.len();
            fresh
        })
    }

    fn elapsed(&self) -> Duration {
        let end = with_output(&self.output, |captured| captured.last_output)
            .or(self.finished)
            .unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started)
    }
}
