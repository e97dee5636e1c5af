//! Scheduler and training-server configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{CommandSpawner, WorkerSpawner};

/// Port the worker's training server listens on.
pub const DEFAULT_TRAINING_PORT: u16 = 8080;

/// Ceiling on a single training run before the worker is killed.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Training-server configuration shipped to the worker with `server_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_rounds: u32,
    pub batch_size: u32,
    pub local_epochs: u32,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: u32,
    pub min_evaluate_clients: u32,
    pub min_available_clients: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            batch_size: 32,
            local_epochs: 5,
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
        }
    }
}

impl TrainingConfig {
    pub fn with_num_rounds(mut self, num_rounds: u32) -> Self {
        self.num_rounds = num_rounds;
        self
    }
}

pub struct SchedulerConfig {
    /// Fixed port handed to callers and to the worker.
    pub port: u16,
    pub job_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when a worker is torn down.
    pub kill_grace: Duration,
    pub probe_timeout: Duration,
    /// Probe a running worker before reuse once it has been silent this long.
    /// `None` disables the idle probe.
    pub idle_probe_after: Option<Duration>,
    pub training: TrainingConfig,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SchedulerConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            port: DEFAULT_TRAINING_PORT,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            kill_grace: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(100),
            idle_probe_after: Some(Duration::from_secs(10 * 60)),
            training: TrainingConfig::default(),
            spawner,
        }
    }

    /// Spawn workers by running `program` with `args`.
    pub fn with_command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(CommandSpawner::new(program).args(args)))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_idle_probe_after(mut self, idle: Option<Duration>) -> Self {
        self.idle_probe_after = idle;
        self
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("port", &self.port)
            .field("job_timeout", &self.job_timeout)
            .field("kill_grace", &self.kill_grace)
            .field("probe_timeout", &self.probe_timeout)
            .field("idle_probe_after", &self.idle_probe_after)
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}
