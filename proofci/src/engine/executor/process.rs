//! Supervising one sandboxed verifier process.

use process_utils::{GroupSignal, SandboxCommandExt, signal_group, tokio_command};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Extra time allowed for `<runtime> stop` beyond its own grace period.
const STOP_COMMAND_SLACK: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8 * 1024;

/// Bounds for one run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunLimits {
    pub timeout: Duration,
    pub grace: Duration,
    pub output_cap: usize,
}

/// A named container started through a runtime CLI.
#[derive(Debug, Clone)]
pub(crate) struct ContainerRef {
    pub runtime: String,
    pub name: String,
}

#[derive(Debug)]
pub(crate) enum RunEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Tail of an output stream plus its full length.
#[derive(Debug, Default, Clone)]
pub(crate) struct CapturedStream {
    pub tail: Vec<u8>,
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn truncated(&self) -> bool {
        self.total_bytes > self.tail.len() as u64
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.tail).into_owned()
    }
}

#[derive(Debug)]
pub(crate) struct CapturedRun {
    pub end: RunEnd,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub elapsed: Duration,
    /// Process group led by the child.
    pub pgid: Option<u32>,
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> CapturedStream {
    let mut tail = Vec::with_capacity(cap.min(READ_CHUNK));
    let mut total_bytes = 0u64;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_bytes += n as u64;
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > cap.saturating_mul(2) {
                    let excess = tail.len() - cap;
                    tail.drain(..excess);
                }
            }
        }
    }
    if tail.len() > cap {
        let excess = tail.len() - cap;
        tail.drain(..excess);
    }
    CapturedStream { tail, total_bytes }
}

async fn collect(handle: Option<JoinHandle<CapturedStream>>, wait: Duration) -> CapturedStream {
    let Some(mut handle) = handle else {
        return CapturedStream::default();
    };
    match tokio::time::timeout(wait, &mut handle).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Output reader failed: {}", e);
            CapturedStream::default()
        }
        Err(_) => {
            // A descendant still holds the pipe open.
            handle.abort();
            CapturedStream::default()
        }
    }
}

/// Spawn `command` as a process group leader, capture its output and wait
/// for it to exit, time out or be cancelled.
///
/// On timeout or cancellation the container (if any) is stopped through
/// its runtime, otherwise the group gets `SIGTERM`; either way the group is
/// killed if it is still there after `limits.grace`.
pub(crate) async fn run_captured(
    mut command: Command,
    limits: RunLimits,
    cancel: &CancellationToken,
    container: Option<&ContainerRef>,
) -> io::Result<CapturedRun> {
    command
        .own_process_group()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = command.spawn()?;
    let pgid = child.id();

    let stdout = child
        .stdout
        .take()
        .map(|s| tokio::spawn(read_tail(s, limits.output_cap)));
    let stderr = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_tail(s, limits.output_cap)));

    let end = tokio::select! {
        status = child.wait() => RunEnd::Exited(status?),
        _ = tokio::time::sleep(limits.timeout) => RunEnd::TimedOut,
        _ = cancel.cancelled() => RunEnd::Cancelled,
    };

    if !matches!(end, RunEnd::Exited(_)) {
        debug!(?end, "Stopping verifier process");
        stop_child(&mut child, pgid, container, limits.grace).await;
    }
    let elapsed = started.elapsed();

    Ok(CapturedRun {
        end,
        stdout: collect(stdout, limits.grace).await,
        stderr: collect(stderr, limits.grace).await,
        elapsed,
        pgid,
    })
}

async fn stop_child(
    child: &mut Child,
    pgid: Option<u32>,
    container: Option<&ContainerRef>,
    grace: Duration,
) {
    match container {
        None => {
            if let Some(pgid) = pgid
                && let Err(e) = signal_group(pgid, GroupSignal::Terminate)
            {
                debug!(pgid, "SIGTERM to process group failed: {}", e);
            }
        }
        Some(ContainerRef { runtime, name }) => {
            let grace_secs = grace.as_secs().max(1).to_string();
            let status = tokio_command(runtime)
                .args(["stop", "-t", &grace_secs, name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match tokio::time::timeout(grace + STOP_COMMAND_SLACK, status).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    debug!(container = %name, "{} stop exited with {}", runtime, status)
                }
                Ok(Err(e)) => debug!(container = %name, "{} stop failed: {}", runtime, e),
                Err(_) => debug!(container = %name, "{} stop did not return", runtime),
            }
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!(
        "Verifier did not exit within {:?} of being asked to stop; killing",
        grace
    );
    if let Some(pgid) = pgid
        && let Err(e) = signal_group(pgid, GroupSignal::Kill)
    {
        debug!(pgid, "SIGKILL to process group failed: {}", e);
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to kill verifier process: {}", e);
    }
}
