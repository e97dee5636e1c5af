//! The Job aggregate: one training run's process, channel and supervisor.
//!
//! A Job exclusively owns the three handles that make up a run and tears
//! them down together in [`Job::teardown`].

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::ControlRequest;
use crate::guard::{WorkerExit, WorkerHandle};
use crate::liveness::{self, Liveness};
use crate::model::{ModelId, SessionId};

/// Unique identifier for one training run.
///
/// Scopes a channel and its supervisor so events from a superseded run
/// can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have piped stdin and stdout: stdin carries
/// control requests, stdout carries worker events.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns `program args...` with the control channel on stdin/stdout.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    /// Parse a whitespace-separated command line such as `python -m worker`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

pub type ControlWriter = Arc<Mutex<FramedWrite<ChildStdin, JsonCodec<ControlRequest>>>>;

/// Tracks when a job last reported anything.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the current job, for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSnapshot {
    pub model: ModelId,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub idle_secs: u64,
}

pub struct Job {
    id: JobId,
    model: ModelId,
    session: SessionId,
    worker: WorkerHandle,
    writer: ControlWriter,
    pongs: mpsc::Receiver<u64>,
    supervisor: JoinHandle<()>,
    activity: Arc<Activity>,
    next_token: u64,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        model: ModelId,
        session: SessionId,
        worker: WorkerHandle,
        writer: ControlWriter,
        pongs: mpsc::Receiver<u64>,
        supervisor: JoinHandle<()>,
        activity: Arc<Activity>,
    ) -> Self {
        Self {
            id,
            model,
            session,
            worker,
            writer,
            pongs,
            supervisor,
            activity,
            next_token: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_alive(&self) -> bool {
        !self.worker.has_exited()
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            model: self.model,
            session_id: self.session,
            pid: self.worker.pid(),
            idle_secs: self.idle_for().as_secs(),
        }
    }

    /// Ping the worker and wait (bounded) for its pong.
    pub async fn probe(&mut self, timeout: Duration) -> Liveness {
        self.next_token += 1;
        let liveness =
            liveness::probe(&*self.writer, &mut self.pongs, self.next_token, timeout).await;
        if liveness.is_alive() {
            self.activity.touch();
        }
        liveness
    }

    /// Kill the worker and wait for the guard to reap it, then tear down.
    pub async fn terminate(mut self) -> WorkerExit {
        self.worker.kill();
        let exit = self.worker.wait().await;
        self.teardown();
        exit
    }

    /// Release everything the job owns.
    ///
    /// Kills the worker if it is still running and closes our end of the
    /// channel. The supervisor is left to drain: it exits on its own once the
    /// worker's stdout closes.
    pub fn teardown(self) {
        tracing::info!(
            job_id = %self.id,
            model = %self.model,
            session_id = %self.session,
            exit = ?self.worker.exit(),
            "Tearing down job"
        );
        self.worker.kill();
        drop(self.writer);
        drop(self.supervisor);
    }
}
