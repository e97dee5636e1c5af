//! Timeout guard - owns the worker process and bounds its lifetime.
//!
//! The guard task waits on the child. It finishes in one of three ways:
//! the child exits on its own, the ceiling elapses, or a teardown asks for
//! the worker to be killed. The outcome is published on a watch channel so
//! the scheduler can check liveness without blocking.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited without intervention.
    Exited(ExitStatus),
    /// Killed after running past the job ceiling.
    TimedOut,
    /// Killed on request (probe failure, shutdown, reclaim).
    Killed,
    /// Waiting on the child failed; the process can no longer be supervised.
    Lost,
}

/// Scheduler-side handle to a guarded worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<WorkerExit>>,
    kill: CancellationToken,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Ask the guard to terminate the worker. Returns immediately.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Wait until the guard reports how the worker ended.
    pub async fn wait(&mut self) -> WorkerExit {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(WorkerExit::Lost),
            Err(_) => WorkerExit::Lost,
        }
    }
}

/// Start guarding `child`, killing it once `ceiling` elapses.
pub fn spawn_timeout_guard(child: Child, ceiling: Duration, grace: Duration) -> WorkerHandle {
    let pid = child.id();
    let kill = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);

    let kill_for_guard = kill.clone();
    tokio::spawn(async move {
        let exit = run_guard(child, pid, ceiling, grace, kill_for_guard).await;
        exit_tx.send_replace(Some(exit));
    });

    WorkerHandle {
        pid,
        exit: exit_rx,
        kill,
    }
}

async fn run_guard(
    mut child: Child,
    pid: Option<u32>,
    ceiling: Duration,
    grace: Duration,
    kill: CancellationToken,
) -> WorkerExit {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                tracing::info!(?pid, %status, "Worker process exited");
                WorkerExit::Exited(status)
            }
            Err(e) => {
                tracing::error!(?pid, error = %e, "Failed to wait for worker process");
                WorkerExit::Lost
            }
        },
        _ = tokio::time::sleep(ceiling) => {
            tracing::warn!(?pid, ceiling_secs = ceiling.as_secs(), "Worker exceeded job ceiling, terminating");
            terminate(&mut child, pid, grace).await;
            WorkerExit::TimedOut
        }
        _ = kill.cancelled() => {
            tracing::info!(?pid, "Terminating worker on request");
            terminate(&mut child, pid, grace).await;
            WorkerExit::Killed
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL and reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?pid, %status, "Worker exited after SIGTERM");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(?pid, error = %e, "Wait after SIGTERM failed");
                }
                Err(_) => {
                    tracing::warn!(?pid, grace_ms = grace.as_millis() as u64, "Worker ignored SIGTERM, killing");
                }
            },
            Err(e) => {
                tracing::debug!(?pid, error = %e, "SIGTERM failed");
            }
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(?pid, error = %e, "Failed to kill worker process");
    }
}
