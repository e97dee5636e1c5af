//! Training supervisor - reads one job's event stream and persists results.
//!
//! Runs as a tokio task per job. It owns the read half of the channel and
//! exits once the worker reports `done` or the stream ends. Reclaiming the
//! job afterwards is the caller's business (see the scheduler).

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::WorkerEvent;
use crate::job::{Activity, JobId};
use crate::model::{ModelId, SessionId, Tensor};
use crate::store::TrainingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Waiting,
    Persisting,
    Done,
}

/// What a finished supervisor observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Parameter snapshots persisted during the run.
    pub rounds_saved: usize,
    /// The worker said `done` (as opposed to the channel just closing).
    pub finished: bool,
}

pub struct Supervisor<R> {
    job_id: JobId,
    model: ModelId,
    session: SessionId,
    events: FramedRead<R, JsonCodec<WorkerEvent>>,
    store: Arc<dyn TrainingStore>,
    pongs: mpsc::Sender<u64>,
    current: watch::Receiver<Option<JobId>>,
    activity: Arc<Activity>,
    state: SupervisorState,
    rounds_saved: usize,
}

impl<R: AsyncRead + Unpin> Supervisor<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        model: ModelId,
        session: SessionId,
        events: FramedRead<R, JsonCodec<WorkerEvent>>,
        store: Arc<dyn TrainingStore>,
        pongs: mpsc::Sender<u64>,
        current: watch::Receiver<Option<JobId>>,
        activity: Arc<Activity>,
    ) -> Self {
        Self {
            job_id,
            model,
            session,
            events,
            store,
            pongs,
            current,
            activity,
            state: SupervisorState::Waiting,
            rounds_saved: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub async fn run(mut self) -> RunSummary {
        tracing::debug!(job_id = %self.job_id, model = %self.model, "Supervisor started");
        let mut finished = false;

        while let Some(frame) = self.events.next().await {
            let event = match frame {
                Ok(Ok(event)) => event,
                Ok(Err(malformed)) => {
                    tracing::warn!(job_id = %self.job_id, error = %malformed, "Ignoring malformed worker message");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Worker channel read failed");
                    break;
                }
            };

            self.activity.touch();
            tracing::trace!(job_id = %self.job_id, kind = event.kind(), "Worker event");

            match event {
                WorkerEvent::Pong { token } => self.forward_pong(token),
                WorkerEvent::SaveParams { params } => self.persist(params).await,
                WorkerEvent::Error { message } => {
                    tracing::warn!(job_id = %self.job_id, model = %self.model, %message, "Worker reported an error");
                    self.touch_session().await;
                }
                WorkerEvent::Done => {
                    finished = true;
                    break;
                }
            }
        }

        self.state = SupervisorState::Done;
        self.touch_session().await;

        if finished {
            tracing::info!(job_id = %self.job_id, rounds_saved = self.rounds_saved, "Training run finished");
        } else {
            tracing::warn!(job_id = %self.job_id, rounds_saved = self.rounds_saved, "Worker channel closed before done");
        }

        RunSummary {
            rounds_saved: self.rounds_saved,
            finished,
        }
    }

    fn forward_pong(&self, token: u64) {
        match self.pongs.try_send(token) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(job_id = %self.job_id, token, "Pong mailbox full, dropping pong");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(job_id = %self.job_id, token, "No one waiting for pongs");
            }
        }
    }

    fn is_superseded(&self) -> bool {
        matches!(*self.current.borrow(), Some(current) if current != self.job_id)
    }

    async fn persist(&mut self, params: Vec<Tensor>) {
        if params.is_empty() {
            tracing::error!(job_id = %self.job_id, "save_params carried no tensors");
            return;
        }
        if let Some(index) = params.iter().position(|t| !t.is_consistent()) {
            let tensor = &params[index];
            tracing::error!(
                job_id = %self.job_id,
                index,
                shape = ?tensor.shape,
                len = tensor.data.len(),
                "save_params tensor shape does not match its data"
            );
            return;
        }
        if self.is_superseded() {
            tracing::warn!(job_id = %self.job_id, model = %self.model, "Dropping save_params from superseded job");
            return;
        }

        self.state = SupervisorState::Persisting;
        match self.store.save_params(self.model, params).await {
            Ok(record) => {
                self.rounds_saved += 1;
                tracing::info!(
                    job_id = %self.job_id,
                    model = %self.model,
                    params_id = %record.id,
                    tensors = record.params.len(),
                    "Saved model parameters"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %self.job_id, model = %self.model, error = %e, "Failed to save model parameters");
            }
        }
        self.touch_session().await;
        self.state = SupervisorState::Waiting;
    }

    async fn touch_session(&self) {
        if let Err(e) = self.store.touch_session(self.session).await {
            tracing::error!(job_id = %self.job_id, session_id = %self.session, error = %e, "Failed to refresh session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelParams, Session};
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use futures::SinkExt;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio::task::JoinHandle;
    use tokio_util::codec::FramedWrite;

    struct Harness {
        worker: FramedWrite<DuplexStream, JsonCodec<WorkerEvent>>,
        pongs: mpsc::Receiver<u64>,
        current: watch::Sender<Option<JobId>>,
        job_id: JobId,
        session: Session,
        activity: Arc<Activity>,
        task: JoinHandle<RunSummary>,
    }

    async fn start(store: Arc<MemoryStore>) -> Harness {
        let session = store.create_session(ModelId(7)).await.unwrap();
        start_with(store, session)
    }

    fn start_with(store: Arc<dyn TrainingStore>, session: Session) -> Harness {
        let (ours, theirs) = duplex(64 * 1024);
        let (pong_tx, pong_rx) = mpsc::channel(8);
        let job_id = JobId::new();
        let (current, current_rx) = watch::channel(Some(job_id));
        let activity = Arc::new(Activity::new());

        let supervisor = Supervisor::new(
            job_id,
            ModelId(7),
            session.id,
            FramedRead::new(ours, JsonCodec::new()),
            store,
            pong_tx,
            current_rx,
            Arc::clone(&activity),
        );
        assert_eq!(supervisor.state(), SupervisorState::Waiting);

        Harness {
            worker: FramedWrite::new(theirs, JsonCodec::new()),
            pongs: pong_rx,
            current,
            job_id,
            session,
            activity,
            task: tokio::spawn(supervisor.run()),
        }
    }

    fn toy_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new().with_model(Model::new(7, "toy_regression")))
    }

    async fn finish(mut harness: Harness) -> RunSummary {
        harness.worker.send(WorkerEvent::Done).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("supervisor did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn save_params_are_persisted_in_order() {
        let store = toy_store();
        let mut h = start(store.clone()).await;

        let first = vec![Tensor::new(vec![2], vec![1.0, 2.0])];
        let second = vec![
            Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
            Tensor::new(vec![1], vec![0.5]),
        ];
        h.worker
            .send(WorkerEvent::SaveParams {
                params: first.clone(),
            })
            .await
            .unwrap();
        h.worker
            .send(WorkerEvent::SaveParams {
                params: second.clone(),
            })
            .await
            .unwrap();
        let started = h.session.start_time;
        let session = h.session.id;

        let summary = finish(h).await;
        assert_eq!(
            summary,
            RunSummary {
                rounds_saved: 2,
                finished: true
            }
        );

        let saved: Vec<Vec<Tensor>> = store
            .params_for(ModelId(7))
            .into_iter()
            .map(|p| p.params)
            .collect();
        assert_eq!(saved, vec![first, second]);
        assert!(store.session(session).unwrap().end_time >= started);
    }

    #[tokio::test]
    async fn malformed_payloads_create_no_records() {
        let store = toy_store();
        let mut h = start(store.clone()).await;

        // Not a list: fails to decode at all.
        let payload = br#"{"type":"save_params","params":"weights"}"#;
        let stream = h.worker.get_mut();
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(payload).await.unwrap();

        // Decodes, but the shape disagrees with the data.
        h.worker
            .send(WorkerEvent::SaveParams {
                params: vec![Tensor::new(vec![3], vec![1.0])],
            })
            .await
            .unwrap();
        h.worker
            .send(WorkerEvent::SaveParams { params: vec![] })
            .await
            .unwrap();

        let summary = finish(h).await;
        assert_eq!(summary.rounds_saved, 0);
        assert!(summary.finished);
        assert!(store.params_for(ModelId(7)).is_empty());
    }

    #[tokio::test]
    async fn overflowing_shape_is_dropped_and_the_loop_continues() {
        let store = toy_store();
        let mut h = start(store.clone()).await;

        let huge = 1usize << (usize::BITS / 2);
        h.worker
            .send(WorkerEvent::SaveParams {
                params: vec![Tensor::new(vec![huge, huge], vec![])],
            })
            .await
            .unwrap();
        let valid = vec![Tensor::new(vec![2], vec![1.0, 2.0])];
        h.worker
            .send(WorkerEvent::SaveParams {
                params: valid.clone(),
            })
            .await
            .unwrap();

        let summary = finish(h).await;
        assert_eq!(
            summary,
            RunSummary {
                rounds_saved: 1,
                finished: true
            }
        );
        let saved = store.params_for(ModelId(7));
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].params, valid);
    }

    #[tokio::test]
    async fn error_events_refresh_session_and_activity() {
        let store = toy_store();
        let mut h = start(store.clone()).await;
        let created = h.session.end_time;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.activity.idle_for() >= Duration::from_millis(50));

        h.worker
            .send(WorkerEvent::Error {
                message: "round 3 had too few clients".into(),
            })
            .await
            .unwrap();
        // Events are handled in order, so once the pong arrives the error has been too.
        h.worker.send(WorkerEvent::Pong { token: 1 }).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), h.pongs.recv()).await;
        assert_eq!(pong.unwrap(), Some(1));

        assert!(h.activity.idle_for() < Duration::from_millis(50));
        let refreshed = store.session(h.session.id).unwrap();
        assert!(refreshed.end_time > created);
        assert_eq!(refreshed.start_time, h.session.start_time);

        assert!(finish(h).await.finished);
    }

    #[tokio::test]
    async fn closed_channel_ends_the_run() {
        let store = toy_store();
        let h = start(store.clone()).await;
        let session = h.session.clone();

        drop(h.worker);
        let summary = tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();

        assert!(!summary.finished);
        assert!(store.session(session.id).unwrap().end_time >= session.end_time);
    }

    #[tokio::test]
    async fn superseded_job_does_not_persist() {
        let store = toy_store();
        let mut h = start(store.clone()).await;
        let successor = JobId::new();
        assert_ne!(successor, h.job_id);
        h.current.send_replace(Some(successor));

        h.worker
            .send(WorkerEvent::SaveParams {
                params: vec![Tensor::new(vec![1], vec![1.0])],
            })
            .await
            .unwrap();

        let summary = finish(h).await;
        assert_eq!(summary.rounds_saved, 0);
        assert!(store.params_for(ModelId(7)).is_empty());
    }

    #[tokio::test]
    async fn reclaimed_job_still_persists_its_results() {
        let store = toy_store();
        let mut h = start(store.clone()).await;
        h.current.send_replace(None);

        h.worker
            .send(WorkerEvent::SaveParams {
                params: vec![Tensor::new(vec![1], vec![1.0])],
            })
            .await
            .unwrap();

        assert_eq!(finish(h).await.rounds_saved, 1);
        assert_eq!(store.params_for(ModelId(7)).len(), 1);
    }

    #[tokio::test]
    async fn pongs_are_forwarded() {
        let store = toy_store();
        let mut h = start(store).await;

        h.worker.send(WorkerEvent::Pong { token: 41 }).await.unwrap();
        h.worker
            .send(WorkerEvent::Error {
                message: "round 3 had too few clients".into(),
            })
            .await
            .unwrap();
        h.worker.send(WorkerEvent::Pong { token: 42 }).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), h.pongs.recv()).await;
        let second = tokio::time::timeout(Duration::from_secs(5), h.pongs.recv()).await;
        assert_eq!(first.unwrap(), Some(41));
        assert_eq!(second.unwrap(), Some(42));

        assert!(finish(h).await.finished);
    }

    /// Store whose writes always fail.
    struct BrokenStore(MemoryStore);

    #[async_trait]
    impl TrainingStore for BrokenStore {
        async fn model(&self, id: ModelId) -> Result<Option<Model>, StoreError> {
            self.0.model(id).await
        }
        async fn latest_params(&self, model: ModelId) -> Result<Option<ModelParams>, StoreError> {
            self.0.latest_params(model).await
        }
        async fn save_params(
            &self,
            _model: ModelId,
            _params: Vec<Tensor>,
        ) -> Result<ModelParams, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn create_session(&self, model: ModelId) -> Result<Session, StoreError> {
            self.0.create_session(model).await
        }
        async fn touch_session(&self, id: SessionId) -> Result<Session, StoreError> {
            Err(StoreError::SessionNotFound(id))
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_stop_the_loop() {
        let broken = BrokenStore(MemoryStore::new().with_model(Model::new(7, "toy_regression")));
        let session = broken.create_session(ModelId(7)).await.unwrap();
        let mut h = start_with(Arc::new(broken), session);

        for _ in 0..3 {
            h.worker
                .send(WorkerEvent::SaveParams {
                    params: vec![Tensor::new(vec![1], vec![1.0])],
                })
                .await
                .unwrap();
        }
        h.worker.send(WorkerEvent::Pong { token: 5 }).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), h.pongs.recv()).await;
        assert_eq!(pong.unwrap(), Some(5));

        let summary = finish(h).await;
        assert_eq!(summary.rounds_saved, 0);
        assert!(summary.finished);
    }
}
