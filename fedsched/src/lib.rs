//! fedsched: single-flight scheduler for federated training server processes.

mod guard;
mod liveness;
mod supervisor;
mod version;

pub mod bridge;
pub mod config;
pub mod job;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod worker;

pub use config::{DEFAULT_JOB_TIMEOUT, DEFAULT_TRAINING_PORT, SchedulerConfig, TrainingConfig};
pub use guard::WorkerExit;
pub use job::{CommandSpawner, JobId, JobSnapshot, SpawnError, WorkerSpawner};
pub use liveness::Liveness;
pub use model::{Model, ModelId, ModelParams, ParamsId, Session, SessionId, Tensor};
pub use scheduler::{Scheduler, SchedulerError, ServerGrant, ServerStatus};
pub use store::{FsStore, MemoryStore, StoreError, TrainingStore};
pub use supervisor::{RunSummary, SupervisorState};
pub use version::{FEDSCHED_VERSION, VersionInfo};
pub use worker::{EventSender, ServeError, TrainingServer, run_worker};
