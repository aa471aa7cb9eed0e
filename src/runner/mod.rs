//! Child process lifecycle for a single execution.
//!
//! A [`ProcessRunner`] spawns one external command in its own process group,
//! hands out its stdout/stderr as line streams, and reports how it ended.
//! Cancellation and the optional deadline both terminate the whole group:
//! SIGTERM first, SIGKILL once the grace period runs out.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process was cancelled")]
    Cancelled,

    #[error("process timed out after {}s", after.as_secs())]
    TimedOut { after: Duration },

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Build a command from a full argv. Returns `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory for per-execution output logs. `None` disables them.
    pub log_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL when stopping a process group.
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Spawn `spec` for `execution_id`, stopped when `cancel` fires.
    ///
    /// Must be called from within a tokio runtime: the side-channel log
    /// writer runs as its own task.
    pub fn start(
        &self,
        execution_id: &str,
        spec: &CommandSpec,
        cancel: CancellationToken,
    ) -> Result<RunningProcess, RunnerError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so forked children can be signalled together.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        info!(
            execution_id,
            program = spec.program.as_str(),
            pid,
            timeout_sec = spec.timeout.map(|t| t.as_secs()),
            "process started"
        );

        let tee = self
            .config
            .log_dir
            .as_ref()
            .map(|dir| spawn_log_writer(dir.join(format!("{}.log", execution_id)), execution_id.to_string()));

        let stdout = child
            .stdout
            .take()
            .map(|out| LineStream::new(out, tee.clone()));
        let stderr = child.stderr.take().map(|err| LineStream::new(err, tee));

        Ok(RunningProcess {
            execution_id: execution_id.to_string(),
            child,
            pid,
            stdout,
            stderr,
            cancel,
            timeout: spec.timeout,
            kill_grace: self.config.kill_grace,
        })
    }
}

/// A spawned child plus its cancellation handle.
pub struct RunningProcess {
    execution_id: String,
    child: Child,
    pid: Option<u32>,
    stdout: Option<LineStream<ChildStdout>>,
    stderr: Option<LineStream<ChildStderr>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    kill_grace: Duration,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<LineStream<ChildStdout>> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<LineStream<ChildStderr>> {
        self.stderr.take()
    }

    /// A handle that cancels this process when triggered. Cancelling more
    /// than once, or after exit, does nothing.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the process to end.
    ///
    /// Returns the exit code on a natural exit (-1 when killed by a signal),
    /// [`RunnerError::Cancelled`] or [`RunnerError::TimedOut`] when the
    /// process group had to be stopped.
    pub async fn wait(mut self) -> Result<i32, RunnerError> {
        let deadline = self.timeout;
        let timer = async move {
            match deadline {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);
        let cancel = self.cancel.clone();

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(execution_id = self.execution_id.as_str(), "cancel requested, terminating process group");
                self.terminate().await;
                Err(RunnerError::Cancelled)
            }

            _ = &mut timer => {
                let after = deadline.unwrap_or_default();
                warn!(execution_id = self.execution_id.as_str(), timeout_sec = after.as_secs(), "process timed out, terminating");
                self.terminate().await;
                Err(RunnerError::TimedOut { after })
            }

            status = self.child.wait() => {
                let status = status.map_err(RunnerError::Wait)?;
                let code = status.code().unwrap_or(-1);
                info!(execution_id = self.execution_id.as_str(), exit_code = code, "process exited");
                Ok(code)
            }
        }
    }

    async fn terminate(&mut self) {
        signal_group(self.pid, Signal::Term);
        if self.pid.is_none() {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(exit_code = status.code(), "process group exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "error waiting for process after SIGTERM");
            }
            Err(_) => {
                warn!(
                    execution_id = self.execution_id.as_str(),
                    "process did not exit after SIGTERM, sending SIGKILL"
                );
                signal_group(self.pid, Signal::Kill);
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "failed to SIGKILL process");
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group, so its pid is the group id.
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Line reader over one output pipe.
///
/// Lines are split on `\n`, a trailing `\r` is dropped, and invalid UTF-8 is
/// replaced rather than treated as an error. Each line is also copied to the
/// side-channel log when one is open.
pub struct LineStream<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    tee: Option<mpsc::UnboundedSender<String>>,
}

impl<R: AsyncRead + Unpin> LineStream<R> {
    pub fn new(reader: R, tee: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            tee,
        }
    }

    /// Next line, or `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();

        let tee_closed = self
            .tee
            .as_ref()
            .is_some_and(|tee| tee.send(format!("{}\n", line)).is_err());
        if tee_closed {
            self.tee = None;
        }
        Ok(Some(line))
    }
}

/// Start the best-effort writer for `<log_dir>/<execution_id>.log`.
///
/// Any failure here is logged and the writer gives up; the execution itself
/// is never affected.
fn spawn_log_writer(path: PathBuf, execution_id: String) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        if let Some(dir) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(execution_id = %execution_id, error = %e, "cannot create execution log dir");
                return;
            }
        }
        let file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(execution_id = %execution_id, path = %path.display(), error = %e, "cannot open execution log");
                return;
            }
        };
        let mut out = tokio::io::BufWriter::new(file);
        while let Some(line) = rx.recv().await {
            if let Err(e) = out.write_all(line.as_bytes()).await {
                warn!(execution_id = %execution_id, error = %e, "execution log write failed");
                return;
            }
        }
        if let Err(e) = out.flush().await {
            warn!(execution_id = %execution_id, error = %e, "execution log flush failed");
        }
    });
    tx
}
