//! Owns one external tool process: incremental stdout/stderr, a hard
//! wall-clock timeout, and a two-step termination (SIGTERM, then SIGKILL
//! after a grace period).

use crate::config::ToolInvocation;
use speedwatch_core::MeasurementError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Stdout(Vec<u8>),
    Stderr(String),
    /// Sent once, just before termination starts.
    TimedOut,
    /// Always the last event.
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessSupervisor {
    timeout: Duration,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            timeout,
            kill_grace,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start(&self, invocation: &ToolInvocation) -> Result<SupervisorHandle, MeasurementError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| MeasurementError::Spawn {
            detail: format!("{}: {err}", invocation.program),
        })?;
        let pid = child.id();
        info!(event = "tool_spawned", program = %invocation.program, pid = ?pid);

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_chunks(stdout, tx.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_lines(stderr, tx.clone())));

        let cancel = CancellationToken::new();
        tokio::spawn(watch_child(
            child,
            WatchPlan {
                timeout: self.timeout,
                kill_grace: self.kill_grace,
                cancel: cancel.clone(),
                readers: [stdout_task, stderr_task],
            },
            tx,
        ));

        Ok(SupervisorHandle {
            pid,
            events: rx,
            cancel,
        })
    }
}

pub struct SupervisorHandle {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<SupervisorEvent>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `None` once `Exited` has been delivered.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.events.recv().await
    }

    /// Starts graceful termination. Idempotent.
    pub fn kill(&self) {
        if !self.cancel.is_cancelled() {
            debug!(event = "tool_kill_requested", pid = ?self.pid);
        }
        self.cancel.cancel();
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchPlan {
    timeout: Duration,
    kill_grace: Duration,
    cancel: CancellationToken,
    readers: [Option<JoinHandle<()>>; 2],
}

async fn watch_child(
    mut child: Child,
    plan: WatchPlan,
    tx: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let pid = child.id();
    let deadline = tokio::time::sleep(plan.timeout);
    tokio::pin!(deadline);

    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = &mut deadline => {
            warn!(event = "tool_timeout", pid = ?pid, timeout_secs = plan.timeout.as_secs());
            let _ = tx.send(SupervisorEvent::TimedOut);
            terminate(&mut child, pid, plan.kill_grace).await
        }
        _ = plan.cancel.cancelled() => terminate(&mut child, pid, plan.kill_grace).await,
    };

    // Leftover grandchildren can hold the pipes open; bound the drain.
    let mut readers = plan.readers;
    let drained = tokio::time::timeout(plan.kill_grace.max(Duration::from_millis(500)), async {
        for task in readers.iter_mut().flatten() {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        signal_group(pid, GroupSignal::Kill);
        for task in readers.iter().flatten() {
            task.abort();
        }
        debug!(event = "tool_drain_abandoned", pid = ?pid);
    }

    let code = status.and_then(|status| status.code());
    info!(event = "tool_exited", pid = ?pid, code = ?code);
    let _ = tx.send(SupervisorEvent::Exited(code));
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> Option<ExitStatus> {
    if cfg!(unix) && signal_group(pid, GroupSignal::Term) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok();
        }
        warn!(event = "tool_kill_escalated", pid = ?pid, grace_secs = grace.as_secs());
    }
    signal_group(pid, GroupSignal::Kill);
    let _ = child.start_kill();
    child.wait().await.ok()
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> bool {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // The child leads its own process group, so -pid reaches its descendants too.
    // SAFETY: kill(2) takes plain integers and touches no memory owned by this
    // process; a stale or foreign group id only yields ESRCH or EPERM.
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}

async fn forward_chunks<R>(mut reader: R, tx: mpsc::UnboundedSender<SupervisorEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(SupervisorEvent::Stdout(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(event = "tool_stdout_error", error = %err);
                break;
            }
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<SupervisorEvent>)
where
    R: AsyncRead + Unpin,
{
    // Tool diagnostics are not guaranteed UTF-8; decode lossily per line.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(SupervisorEvent::Stderr(line)).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(event = "tool_stderr_error", error = %err);
                break;
            }
        }
    }
}
