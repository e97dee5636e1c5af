use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{StoreError, TrainingStore};
use crate::model::{Model, ModelId, ModelParams, ParamsId, Session, SessionId, Tensor};

/// In-process store backed by concurrent maps. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    models: DashMap<ModelId, Model>,
    params: DashMap<ModelId, Vec<ModelParams>>,
    sessions: DashMap<SessionId, Session>,
    next_params_id: AtomicI64,
    next_session_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model: Model) -> Self {
        self.register_model(model);
        self
    }

    pub fn register_model(&self, model: Model) {
        self.models.insert(model.id, model);
    }

    /// All snapshots saved for `model`, oldest first.
    pub fn params_for(&self, model: ModelId) -> Vec<ModelParams> {
        self.params
            .get(&model)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl TrainingStore for MemoryStore {
    async fn model(&self, id: ModelId) -> Result<Option<Model>, StoreError> {
        Ok(self.models.get(&id).map(|m| m.clone()))
    }

    async fn latest_params(&self, model: ModelId) -> Result<Option<ModelParams>, StoreError> {
        Ok(self
            .params
            .get(&model)
            .and_then(|p| p.last().cloned()))
    }

    async fn save_params(
        &self,
        model: ModelId,
        params: Vec<Tensor>,
    ) -> Result<ModelParams, StoreError> {
        if !self.models.contains_key(&model) {
            return Err(StoreError::ModelNotFound(model));
        }
        let record = ModelParams {
            id: ParamsId(self.next_params_id.fetch_add(1, Ordering::SeqCst) + 1),
            model,
            params,
            created_at: Utc::now(),
        };
        self.params.entry(model).or_default().push(record.clone());
        Ok(record)
    }

    async fn create_session(&self, model: ModelId) -> Result<Session, StoreError> {
        if !self.models.contains_key(&model) {
            return Err(StoreError::ModelNotFound(model));
        }
        let now = Utc::now();
        let session = Session {
            id: SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1),
            model,
            start_time: now,
            end_time: now,
        };
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn touch_session(&self, id: SessionId) -> Result<Session, StoreError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        session.end_time = Utc::now();
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new().with_model(Model::new(7, "toy_regression"))
    }

    #[tokio::test]
    async fn model_lookup() {
        let store = store();
        assert_eq!(store.model(ModelId(7)).await.unwrap().unwrap().name, "toy_regression");
        assert!(store.model(ModelId(8)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_params_is_most_recent() {
        let store = store();
        assert!(store.latest_params(ModelId(7)).await.unwrap().is_none());

        store
            .save_params(ModelId(7), vec![Tensor::new(vec![1], vec![1.0])])
            .await
            .unwrap();
        let second = store
            .save_params(ModelId(7), vec![Tensor::new(vec![1], vec![2.0])])
            .await
            .unwrap();

        let latest = store.latest_params(ModelId(7)).await.unwrap().unwrap();
        assert_eq!(latest, second);
        assert_eq!(store.params_for(ModelId(7)).len(), 2);
    }

    #[tokio::test]
    async fn save_params_for_unknown_model_fails() {
        let store = store();
        let result = store.save_params(ModelId(99), vec![]).await;
        assert!(matches!(result, Err(StoreError::ModelNotFound(ModelId(99)))));
    }

    #[tokio::test]
    async fn sessions_get_sequential_ids_and_refresh() {
        let store = store();
        let first = store.create_session(ModelId(7)).await.unwrap();
        let second = store.create_session(ModelId(7)).await.unwrap();
        assert_eq!(first.id, SessionId(1));
        assert_eq!(second.id, SessionId(2));
        assert_eq!(first.start_time, first.end_time);

        let touched = store.touch_session(first.id).await.unwrap();
        assert_eq!(touched.start_time, first.start_time);
        assert!(touched.end_time >= first.end_time);
    }

    #[tokio::test]
    async fn touch_unknown_session_fails() {
        let store = store();
        let result = store.touch_session(SessionId(5)).await;
        assert!(matches!(result, Err(StoreError::SessionNotFound(SessionId(5)))));
    }
}
