use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolcore::{OutputSink, OutputStream};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Process timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Process cancelled")]
    Cancelled,
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a process that ran to completion (whatever its exit code).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

enum Ended {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut(Duration),
}

/// Runs one child process at a time per call, streaming its output.
///
/// Both pipes are drained by their own task so a chatty stderr can never
/// stall stdout. On unix the child leads its own process group, so the stop
/// path reaches everything it spawned. Cancellation and timeout share that
/// path: `SIGTERM` to the group, a wait for the child, then `SIGKILL`, with
/// the readers drained concurrently. All of it fits in `grace_period`.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub async fn run(
        &self,
        spec: &ProcessSpec,
        sink: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutcome, SupervisorError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        tracing::debug!(pid = ?child.id(), "Spawned: {}", spec.display());

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, OutputStream::Stdout, sink.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, OutputStream::Stderr, sink.clone())));

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let ended = tokio::select! {
            biased;
            status = child.wait() => Ended::Exited(status.map_err(SupervisorError::Wait)?),
            _ = cancel.cancelled() => Ended::Cancelled,
            _ = &mut deadline => Ended::TimedOut(timeout.unwrap_or_default()),
        };

        match ended {
            Ended::Exited(status) => {
                let (stdout, stderr) =
                    drain_both(stdout, stderr, Instant::now() + self.grace_period).await;
                tracing::debug!(code = ?status.code(), "Process exited");
                Ok(ProcessOutcome {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                })
            }
            Ended::Cancelled => {
                tracing::info!("Cancelling: {}", spec.display());
                self.stop(&mut child, stdout, stderr).await;
                Err(SupervisorError::Cancelled)
            }
            Ended::TimedOut(limit) => {
                tracing::warn!("Timed out after {:?}: {}", limit, spec.display());
                self.stop(&mut child, stdout, stderr).await;
                Err(SupervisorError::Timeout {
                    ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Terminate the child's process group and drain its readers, all within
    /// one grace period. The tail of the budget is kept for the readers.
    async fn stop(
        &self,
        child: &mut Child,
        stdout: Option<JoinHandle<String>>,
        stderr: Option<JoinHandle<String>>,
    ) {
        let started = Instant::now();
        let deadline = started + self.grace_period;
        let reserve = (self.grace_period / 5).min(Duration::from_millis(250));
        let term_deadline = deadline - reserve;

        let pid = child.id();
        let mut exited = false;
        if let Some(pid) = pid {
            if signal_group(pid, "TERM").await {
                match tokio::time::timeout_at(term_deadline, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(pid, code = ?status.code(), "Stopped within grace period");
                        exited = true;
                    }
                    Ok(Err(e)) => tracing::warn!(pid, "Wait after SIGTERM failed: {}", e),
                    Err(_) => tracing::warn!(pid, "Grace period elapsed, killing"),
                }
            }
        }

        // Descendants may outlive a cooperative child and hold the pipes open.
        if let Some(pid) = pid {
            signal_group(pid, "KILL").await;
        }
        if !exited {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill process: {}", e);
            }
        }

        drain_both(stdout, stderr, deadline).await;
        tracing::debug!("Stop took {:?}", started.elapsed());
    }
}

/// Collect both readers concurrently, abandoning whatever is still open at `deadline`.
async fn drain_both(
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    deadline: Instant,
) -> (String, String) {
    tokio::join!(drain(stdout, deadline), drain(stderr, deadline))
}

async fn drain(task: Option<JoinHandle<String>>, deadline: Instant) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            tracing::warn!("Output pipe still open after grace period, abandoning reader");
            task.abort();
            String::new()
        }
    }
}

async fn pump<R>(reader: R, stream: OutputStream, sink: Arc<dyn OutputSink>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                sink.line(stream, &line);
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Stopped reading {}: {}", stream, e);
                break;
            }
        }
    }
    collected
}

/// Signal the process group led by `pid`. Returns false when nothing was signalled.
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    let group = format!("-{}", pid);
    match Command::new("kill")
        .args([format!("-{}", signal).as_str(), "--", group.as_str()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::warn!(pid, "Failed to send SIG{}: {}", signal, e);
            false
        }
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}
