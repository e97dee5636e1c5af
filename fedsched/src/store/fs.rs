//! Filesystem store: one JSON document per record.
//!
//! Layout under the root directory:
//! - `models/{id}.json`
//! - `params/{model}/{id}.json`
//! - `sessions/{id}.json`
//!
//! Ids are allocated by scanning existing documents, under a single write
//! lock, so a restarted process keeps counting where the last one stopped.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use super::{StoreError, TrainingStore};
use crate::model::{Model, ModelId, ModelParams, ParamsId, Session, SessionId, Tensor};

pub struct FsStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["models", "params", "sessions"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        tracing::debug!(root = %root.display(), "Opened filesystem store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn register_model(&self, model: &Model) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.model_path(model.id), model).await
    }

    fn model_path(&self, id: ModelId) -> PathBuf {
        self.root.join("models").join(format!("{id}.json"))
    }

    fn params_dir(&self, model: ModelId) -> PathBuf {
        self.root.join("params").join(model.to_string())
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    async fn max_params_id(&self) -> Result<i64, StoreError> {
        let mut max = 0;
        let mut models = tokio::fs::read_dir(self.root.join("params")).await?;
        while let Some(entry) = models.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                max = max.max(max_record_id(&entry.path()).await?);
            }
        }
        Ok(max)
    }
}

#[async_trait]
impl TrainingStore for FsStore {
    async fn model(&self, id: ModelId) -> Result<Option<Model>, StoreError> {
        read_json(&self.model_path(id)).await
    }

    async fn latest_params(&self, model: ModelId) -> Result<Option<ModelParams>, StoreError> {
        let dir = self.params_dir(model);
        let latest = match max_record_id(&dir).await {
            Ok(0) => return Ok(None),
            Ok(id) => id,
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        read_json(&dir.join(format!("{latest}.json"))).await
    }

    async fn save_params(
        &self,
        model: ModelId,
        params: Vec<Tensor>,
    ) -> Result<ModelParams, StoreError> {
        if self.model(model).await?.is_none() {
            return Err(StoreError::ModelNotFound(model));
        }
        let _guard = self.write_lock.lock().await;
        let dir = self.params_dir(model);
        tokio::fs::create_dir_all(&dir).await?;

        let record = ModelParams {
            id: ParamsId(self.max_params_id().await? + 1),
            model,
            params,
            created_at: Utc::now(),
        };
        write_json(&dir.join(format!("{}.json", record.id)), &record).await?;
        Ok(record)
    }

    async fn create_session(&self, model: ModelId) -> Result<Session, StoreError> {
        if self.model(model).await?.is_none() {
            return Err(StoreError::ModelNotFound(model));
        }
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let session = Session {
            id: SessionId(max_record_id(&self.root.join("sessions")).await? + 1),
            model,
            start_time: now,
            end_time: now,
        };
        write_json(&self.session_path(session.id), &session).await?;
        Ok(session)
    }

    async fn touch_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(id);
        let mut session: Session = read_json(&path)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;
        session.end_time = Utc::now();
        write_json(&path, &session).await?;
        Ok(session)
    }
}

/// Largest numeric `{id}.json` stem in `dir`, or 0 when there is none.
async fn max_record_id(dir: &Path) -> Result<i64, StoreError> {
    let mut max = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        {
            max = max.max(id);
        }
    }
    Ok(max)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file + rename so readers never see a partial document.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
