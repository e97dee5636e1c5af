//! Single-flight job coordinator.
//!
//! At most one training job exists at a time. `request_server` decides
//! between reusing it, starting a new one, or reporting the slot as occupied,
//! all under one async mutex. The only other writer of the slot is a
//! supervisor reclaiming its own job once the worker finishes.

use std::sync::{Arc, Weak};

use futures::SinkExt;
use serde::Serialize;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ServerSpec};
use crate::config::SchedulerConfig;
use crate::guard::spawn_timeout_guard;
use crate::job::{Activity, ControlWriter, Job, JobId, JobSnapshot, SpawnError};
use crate::model::{ModelId, SessionId, Tensor};
use crate::store::{StoreError, TrainingStore};
use crate::supervisor::Supervisor;

/// Pongs buffered per job. Anything beyond this is stale by definition.
const PONG_MAILBOX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// A job for this model was already running.
    Started,
    /// A job was started for this request.
    New,
    /// A job for a different model holds the slot.
    Occupied,
}

/// Answer to a server request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerGrant {
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ServerGrant {
    fn granted(status: ServerStatus, session: SessionId, port: u16) -> Self {
        Self {
            status,
            session_id: Some(session),
            port: Some(port),
        }
    }

    fn occupied() -> Self {
        Self {
            status: ServerStatus::Occupied,
            session_id: None,
            port: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("model {0} not found")]
    UnknownModel(ModelId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Cheaply cloneable handle to the process-wide scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn TrainingStore>,
    slot: Mutex<Option<Job>>,
    /// Id of the job in `slot`, readable without the mutex.
    current: watch::Sender<Option<JobId>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn TrainingStore>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                slot: Mutex::new(None),
                current,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Request a training server for `model`.
    ///
    /// Never blocks on worker progress; the only wait is the bounded liveness
    /// probe before reusing an idle job.
    pub async fn request_server(
        &self,
        model: ModelId,
        start_fresh: bool,
    ) -> Result<ServerGrant, SchedulerError> {
        let inner = &self.inner;
        if inner.store.model(model).await?.is_none() {
            return Err(SchedulerError::UnknownModel(model));
        }

        let mut slot = inner.slot.lock().await;

        if let Some(job) = slot.take_if(|job| !job.is_alive()) {
            tracing::info!(job_id = %job.id(), model = %job.model(), "Reaping finished job");
            inner.clear_current(job.id());
            job.teardown();
        }

        let unresponsive = match slot.as_mut() {
            Some(job) if job.model() == model && inner.needs_probe(job) => {
                !job.probe(inner.config.probe_timeout).await.is_alive()
            }
            _ => false,
        };
        if unresponsive && let Some(job) = slot.take() {
            tracing::warn!(job_id = %job.id(), model = %model, "Worker failed liveness probe, replacing it");
            inner.clear_current(job.id());
            job.teardown();
        }

        if let Some(job) = slot.as_ref() {
            if job.model() == model {
                tracing::debug!(job_id = %job.id(), model = %model, "Reusing running job");
                return Ok(ServerGrant::granted(
                    ServerStatus::Started,
                    job.session(),
                    inner.config.port,
                ));
            }
            tracing::info!(requested = %model, running = %job.model(), "Training slot occupied");
            return Ok(ServerGrant::occupied());
        }

        let initial_params = if start_fresh {
            Vec::new()
        } else {
            inner.prior_params(model).await
        };
        let worker = inner.spawn_worker()?;
        let session = match inner.store.create_session(model).await {
            Ok(session) => session,
            Err(e) => {
                worker.abandon();
                return Err(e.into());
            }
        };
        let job = self.launch(model, session.id, worker, initial_params);
        let grant = ServerGrant::granted(ServerStatus::New, job.session(), inner.config.port);
        *slot = Some(job);
        Ok(grant)
    }

    /// The running job, if any.
    pub async fn snapshot(&self) -> Option<JobSnapshot> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref().filter(|job| job.is_alive()).map(Job::snapshot)
    }

    /// Stop the running job (if any) and wait for its worker to be reaped.
    pub async fn shutdown(&self) {
        let job = self.inner.slot.lock().await.take();
        if let Some(job) = job {
            self.inner.clear_current(job.id());
            let exit = job.terminate().await;
            tracing::info!(?exit, "Scheduler shut down");
        }
    }

    fn launch(
        &self,
        model: ModelId,
        session: SessionId,
        spawned: SpawnedWorker,
        initial_params: Vec<Tensor>,
    ) -> Job {
        let inner = &self.inner;
        let config = &inner.config;
        let SpawnedWorker {
            child,
            stdin,
            stdout,
        } = spawned;

        let job_id = JobId::new();
        let worker = spawn_timeout_guard(child, config.job_timeout, config.kill_grace);
        tracing::info!(
            job_id = %job_id,
            model = %model,
            session_id = %session,
            pid = ?worker.pid(),
            seeded = !initial_params.is_empty(),
            "Started training worker"
        );

        inner.current.send_replace(Some(job_id));

        let (pong_tx, pong_rx) = mpsc::channel(PONG_MAILBOX);
        let activity = Arc::new(Activity::new());
        let supervisor = Supervisor::new(
            job_id,
            model,
            session,
            FramedRead::new(stdout, JsonCodec::new()),
            Arc::clone(&inner.store),
            pong_tx,
            inner.current.subscribe(),
            Arc::clone(&activity),
        );
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let supervisor = tokio::spawn(async move {
            let summary = supervisor.run().await;
            tracing::debug!(job_id = %job_id, ?summary, "Supervisor exited");
            if let Some(inner) = weak.upgrade() {
                inner.reclaim(job_id).await;
            }
        });

        let writer: ControlWriter = Arc::new(Mutex::new(FramedWrite::new(stdin, JsonCodec::new())));
        let request = ControlRequest::ServerRequest(ServerSpec {
            model,
            initial_params,
            config: config.training.clone(),
            port: config.port,
        });
        let request_writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let mut w = request_writer.lock().await;
            if let Err(e) = w.send(request).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to send server request");
            }
        });

        Job::new(
            job_id, model, session, worker, writer, pong_rx, supervisor, activity,
        )
    }
}

/// A freshly spawned worker whose job has not been set up yet.
struct SpawnedWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl SpawnedWorker {
    /// Kill a worker that will never get a job.
    fn abandon(mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = ?self.child.id(), error = %e, "Failed to kill abandoned worker");
        }
    }
}

impl Inner {
    fn spawn_worker(&self) -> Result<SpawnedWorker, SpawnError> {
        let mut child = self.config.spawner.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("worker stdin is not piped".into()));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("worker stdout is not piped".into()));
        match (stdin, stdout) {
            (Ok(stdin), Ok(stdout)) => Ok(SpawnedWorker {
                child,
                stdin,
                stdout,
            }),
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.start_kill();
                Err(e)
            }
        }
    }

    fn needs_probe(&self, job: &Job) -> bool {
        self.config
            .idle_probe_after
            .is_some_and(|after| job.idle_for() >= after)
    }

    async fn prior_params(&self, model: ModelId) -> Vec<Tensor> {
        match self.store.latest_params(model).await {
            Ok(Some(record)) => {
                tracing::debug!(model = %model, params_id = %record.id, "Seeding worker with saved parameters");
                record.params
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Could not load saved parameters, starting fresh");
                Vec::new()
            }
        }
    }

    fn clear_current(&self, job_id: JobId) {
        self.current.send_if_modified(|current| {
            if *current == Some(job_id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Drop `job_id` from the slot if it still holds it.
    async fn reclaim(&self, job_id: JobId) {
        let mut slot = self.slot.lock().await;
        if let Some(job) = slot.take_if(|job| job.id() == job_id) {
            self.clear_current(job_id);
            job.teardown();
        }
    }
}
