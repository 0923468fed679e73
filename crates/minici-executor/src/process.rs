//! Subprocess execution bound to a cancellation token and a deadline.
//!
//! Each step runs in its own process group. On cancel or timeout the whole
//! group is killed, so shells and everything they spawned go down together.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StepError;
use crate::sink::{LogSink, SinkError};

/// Lines of output kept for error messages.
const TAIL_LINES: usize = 20;

/// What stopped a step early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

impl From<Interrupt> for StepError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => StepError::Cancelled,
            Interrupt::TimedOut => StepError::TimedOut,
        }
    }
}

/// Cancellation token plus an absolute deadline shared by every step of a build.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl RunControl {
    /// Deadline is `timeout` from now.
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking check. Cancellation wins over an expired deadline.
    pub fn check(&self) -> Option<Interrupt> {
        if self.cancel.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }

    /// Resolves when the build is cancelled or the deadline passes.
    pub async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Interrupt::TimedOut,
        }
    }
}

/// One external command run as a build step.
#[derive(Debug, Clone)]
pub struct StepCommand {
    step: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl StepCommand {
    pub fn new(step: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// `sh -c <script>`.
    pub fn shell(step: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(step, "sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[derive(Clone, Default)]
struct OutputTail(Arc<Mutex<VecDeque<String>>>);

impl OutputTail {
    fn push(&self, line: &[u8]) {
        let mut lines = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(String::from_utf8_lossy(line).trim_end().to_string());
    }

    fn render(&self) -> String {
        let lines = self.0.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Run `cmd` to completion, streaming stdout and stderr line by line into `sink`.
///
/// Returns `Cancelled`/`TimedOut` if `control` fires first, after the process
/// group has been killed. A non-zero exit is `Failed` with the output tail.
pub async fn run_step(
    cmd: &StepCommand,
    sink: &Arc<LogSink>,
    control: &RunControl,
) -> Result<(), StepError> {
    if let Some(interrupt) = control.check() {
        return Err(interrupt.into());
    }

    let mut child = cmd.command().spawn().map_err(|source| StepError::Spawn {
        step: cmd.step.clone(),
        source,
    })?;
    let pgid = child.id();
    debug!(step = %cmd.step, pid = ?pgid, "Step started");

    let tail = OutputTail::default();
    let stdout = tokio::spawn(pump(child.stdout.take(), sink.clone(), tail.clone()));
    let stderr = tokio::spawn(pump(child.stderr.take(), sink.clone(), tail.clone()));
    let aborts = [stdout.abort_handle(), stderr.abort_handle()];

    let waited = tokio::select! {
        biased;
        interrupt = control.interrupted() => Err(interrupt),
        status = child.wait() => Ok(status),
    };

    let status = match waited {
        Ok(status) => status.map_err(|source| StepError::Spawn {
            step: cmd.step.clone(),
            source,
        })?,
        Err(interrupt) => {
            kill_process_group(pgid, &mut child);
            let _ = child.wait().await;
            aborts.iter().for_each(|a| a.abort());
            debug!(step = %cmd.step, ?interrupt, "Step interrupted");
            return Err(interrupt.into());
        }
    };

    // Background children may hold the pipes open past the main process.
    let drained = async {
        let out = stdout.await;
        let err = stderr.await;
        (out, err)
    };
    let pumped = tokio::select! {
        biased;
        interrupt = control.interrupted() => {
            kill_process_group(pgid, &mut child);
            aborts.iter().for_each(|a| a.abort());
            return Err(interrupt.into());
        }
        pumped = drained => pumped,
    };

    for result in [pumped.0, pumped.1] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(StepError::Storage(e)),
            Err(e) => warn!(step = %cmd.step, error = %e, "Output pump did not finish"),
        }
    }

    if status.success() {
        Ok(())
    } else {
        Err(StepError::Failed {
            step: cmd.step.clone(),
            status: status.to_string(),
            output: tail.render(),
        })
    }
}

/// Copy `reader` into `sink` one line at a time.
///
/// Subscriber failures only cost that subscriber. A log file failure is
/// remembered and returned, but the pipe keeps draining so the child never
/// blocks on a full pipe.
async fn pump<R>(reader: Option<R>, sink: Arc<LogSink>, tail: OutputTail) -> Result<(), SinkError>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    let mut failure = None;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                tail.push(&line);
                if failure.is_some() {
                    continue;
                }
                match sink.write(&line) {
                    Ok(()) => {}
                    Err(e) if e.is_subscriber() => {
                        warn!(error = %e, "Dropped log subscriber");
                    }
                    Err(e) => failure = Some(e),
                }
            }
            Err(e) => {
                warn!(error = %e, "Reading step output failed");
                break;
            }
        }
    }

    failure.map_or(Ok(()), Err)
}

/// SIGKILL the child's whole process group, falling back to the child alone.
///
/// `pgid` is captured at spawn time; the group outlives its leader.
fn kill_process_group(pgid: Option<u32>, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        // SAFETY: kill(2) takes plain integers and touches no memory of ours.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc == 0 {
            return;
        }
        debug!(pid, error = %std::io::Error::last_os_error(), "Process group kill failed");
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed, child already gone");
    }
}
