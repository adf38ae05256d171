//! Child process supervision.
//!
//! Runs the agent CLI for one turn: spawns the child, streams stdout/stderr
//! chunks to the caller as they arrive, retains the full buffers, and
//! enforces the per-run timeout. Exit status is always a field of the
//! outcome, never an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long to wait for a killed child to be reaped before giving up.
const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// What to run and how.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// One chunk of child output, delivered in arrival order.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Child exited on its own with this code.
    Exited(i32),
    /// Child was terminated by a signal (cancellation included).
    Signaled(Option<i32>),
    /// The per-run timeout expired and the child was killed.
    TimedOut,
    /// The program could not be spawned at all.
    SpawnFailed,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// The result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// Run a child to completion, streaming output chunks over `chunks`.
///
/// Every chunk is sent before the next read from the same stream, so a slow
/// consumer applies backpressure to the child rather than dropping events.
/// Cancelling `cancel` signals the child, waits out [`KILL_DEADLINE`], and
/// resolves with `Signaled`.
pub async fn run_streaming(
    spec: RunSpec,
    chunks: mpsc::Sender<OutputChunk>,
    cancel: CancellationToken,
) -> RunOutcome {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        "Spawning {} with {} args in {}",
        spec.program.display(),
        spec.args.len(),
        spec.cwd.display()
    );

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("Failed to spawn {}: {}", spec.program.display(), err);
            return RunOutcome {
                status: RunStatus::SpawnFailed,
                duration: started.elapsed(),
                stdout: String::new(),
                stderr: err.to_string(),
            };
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = tokio::spawn(pump_stream(stdout, chunks.clone(), OutputChunk::Stdout));
    let stderr_task = tokio::spawn(pump_stream(stderr, chunks, OutputChunk::Stderr));

    // Resolve the wait first, then act on the child; handlers must not touch
    // the child while its wait future is live.
    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }
    let waited = tokio::select! {
        exit = child.wait() => Waited::Exited(exit),
        _ = tokio::time::sleep(spec.timeout) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let status = match waited {
        Waited::Exited(Ok(status)) => exit_status_to_run_status(status),
        Waited::Exited(Err(err)) => {
            warn!("Error waiting for child: {}", err);
            RunStatus::Signaled(None)
        }
        Waited::TimedOut => {
            warn!(
                "Run of {} exceeded timeout of {:?}, killing",
                spec.program.display(),
                spec.timeout
            );
            kill_and_reap(&mut child).await;
            RunStatus::TimedOut
        }
        Waited::Cancelled => {
            debug!("Run of {} cancelled, killing", spec.program.display());
            kill_and_reap(&mut child).await;
            RunStatus::Signaled(None)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    RunOutcome {
        status,
        duration: started.elapsed(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

async fn pump_stream<R>(
    reader: Option<R>,
    chunks: mpsc::Sender<OutputChunk>,
    wrap: fn(Vec<u8>) -> OutputChunk,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let Some(mut reader) = reader else {
        return buffer;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                // Receiver gone means nobody is watching the stream anymore;
                // keep draining so the child never blocks on a full pipe.
                let _ = chunks.send(wrap(chunk[..n].to_vec())).await;
            }
            Err(err) => {
                debug!("Child stream read error: {}", err);
                break;
            }
        }
    }
    buffer
}

fn exit_status_to_run_status(status: std::process::ExitStatus) -> RunStatus {
    match status.code() {
        Some(code) => RunStatus::Exited(code),
        None => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            RunStatus::Signaled(signal)
        }
    }
}

/// Kill the child and wait for it to be reaped, preventing zombies.
async fn kill_and_reap(child: &mut tokio::process::Child) {
    if let Err(err) = child.start_kill() {
        debug!("start_kill failed (child may have exited): {}", err);
    }
    match tokio::time::timeout(KILL_DEADLINE, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!("Error reaping killed child: {}", err),
        Err(_) => warn!("Timed out waiting for killed child to exit"),
    }
}
