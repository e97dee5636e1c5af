//! Worker subprocess - the child side of the scheduler protocol.
//!
//! The parent side (spawning, supervision) lives in scheduler.rs.
//!
//! Control requests arrive on stdin, events leave on stdout, so nothing else
//! may write to stdout inside the worker. Logs go to stderr.
//!
//! The training server itself is pluggable via [`TrainingServer`]; this
//! module only runs the protocol around it.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ServerSpec, WorkerEvent};
use crate::model::Tensor;

/// Handle a training server uses to report back to the scheduler.
///
/// Events are queued and written in order by a single forwarder task, so
/// calls never block on the pipe.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
    fn send(&self, event: WorkerEvent) -> io::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event channel closed"))
    }

    /// Report the aggregated parameters of one completed round.
    pub fn save_params(&self, params: Vec<Tensor>) -> io::Result<()> {
        self.send(WorkerEvent::SaveParams { params })
    }

    /// Report a non-fatal problem.
    pub fn error(&self, message: impl Into<String>) -> io::Result<()> {
        self.send(WorkerEvent::Error {
            message: message.into(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The server could not bind or initialize.
    #[error("failed to start training server: {message}")]
    Start { message: String },

    /// The server started but training aborted.
    #[error("training failed: {message}")]
    Training { message: String },
}

impl ServeError {
    pub fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
        }
    }

    pub fn training(message: impl Into<String>) -> Self {
        Self::Training {
            message: message.into(),
        }
    }
}

/// The federated training server run inside the worker.
#[async_trait::async_trait]
pub trait TrainingServer: Send + Sync + 'static {
    /// Serve all configured rounds on `spec.port`, reporting each round's
    /// aggregated parameters through `events`. Returning `Ok` means the run
    /// completed.
    async fn serve(&self, spec: ServerSpec, events: EventSender) -> Result<(), ServeError>;
}

type TrainingTask = JoinHandle<Result<(), ServeError>>;

/// Run the worker protocol over this process's stdin/stdout.
pub async fn run_worker<S: TrainingServer>(server: Arc<S>) -> io::Result<()> {
    run_worker_on(stdin(), stdout(), server).await
}

/// Run the worker protocol over arbitrary streams.
///
/// Answers pings at all times, starts `server` on the first
/// `server_request`, and ends with `done` (or `error`) once it returns.
/// A closed control channel aborts the run.
pub async fn run_worker_on<R, W, S>(reader: R, writer: W, server: Arc<S>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: TrainingServer,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let mut events = FramedWrite::new(writer, JsonCodec::<WorkerEvent>::new());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let sender = EventSender { tx: event_tx };

    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let kind = event.kind();
            if let Err(e) = events.send(event).await {
                tracing::warn!(error = %e, kind, "Failed to send event to scheduler");
                return Err(e);
            }
        }
        Ok(())
    });

    let mut training: Option<TrainingTask> = None;

    loop {
        tokio::select! {
            biased;

            request = requests.next() => {
                match request {
                    Some(Ok(Ok(ControlRequest::Ping { token }))) => {
                        tracing::trace!(token, "Ping");
                        let _ = sender.send(WorkerEvent::Pong { token });
                    }
                    Some(Ok(Ok(ControlRequest::ServerRequest(spec)))) => {
                        if training.is_some() {
                            tracing::warn!(model = %spec.model, "Training server already running, ignoring server request");
                            continue;
                        }
                        tracing::info!(
                            model = %spec.model,
                            port = spec.port,
                            num_rounds = spec.config.num_rounds,
                            seeded = !spec.initial_params.is_empty(),
                            "Starting training server"
                        );
                        let server = Arc::clone(&server);
                        let events = sender.clone();
                        training = Some(tokio::spawn(async move { server.serve(spec, events).await }));
                    }
                    Some(Ok(Err(malformed))) => {
                        tracing::warn!(error = %malformed, "Ignoring malformed control message");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Control channel closed (scheduler gone?), exiting");
                        break;
                    }
                }
            }

            result = join_training(&mut training) => {
                training = None;
                let last = match result {
                    Ok(Ok(())) => {
                        tracing::info!("Training server finished");
                        WorkerEvent::Done
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Training server failed");
                        WorkerEvent::Error { message: e.to_string() }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Training server task died");
                        WorkerEvent::Error { message: format!("training server task died: {e}") }
                    }
                };
                let _ = sender.send(last);
                break;
            }
        }
    }

    if let Some(task) = training.take() {
        task.abort();
        let _ = task.await;
    }
    drop(sender);

    match forwarder.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Resolves when the running training task ends; never, if none is running.
async fn join_training(task: &mut Option<TrainingTask>) -> Result<Result<(), ServeError>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
