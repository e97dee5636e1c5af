//! Persistence collaborator for models, parameter snapshots and sessions.
//!
//! The scheduler only talks to [`TrainingStore`]; the backing storage is a
//! deployment choice.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::model::{Model, ModelId, ModelParams, Session, SessionId, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("model {0} not found")]
    ModelNotFound(ModelId),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait TrainingStore: Send + Sync {
    /// Look up a model in the registry.
    async fn model(&self, id: ModelId) -> Result<Option<Model>, StoreError>;

    /// Most recently saved parameters for `model`, if any.
    async fn latest_params(&self, model: ModelId) -> Result<Option<ModelParams>, StoreError>;

    /// Persist one aggregated parameter snapshot.
    async fn save_params(
        &self,
        model: ModelId,
        params: Vec<Tensor>,
    ) -> Result<ModelParams, StoreError>;

    /// Create a session starting now.
    async fn create_session(&self, model: ModelId) -> Result<Session, StoreError>;

    /// Refresh a session's end time to now.
    async fn touch_session(&self, id: SessionId) -> Result<Session, StoreError>;
}
