//! Ping/pong liveness probe for a running worker.
//!
//! Pongs reach the scheduler through the supervisor, which forwards them into
//! a per-job mailbox. A probe drains whatever is already buffered there, sends
//! a ping with a fresh token, and waits (bounded) for the matching pong.

use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::ControlRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Unresponsive,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Probe the worker behind `writer`.
///
/// The whole exchange (acquiring the writer, sending, waiting) shares one
/// `timeout` budget.
pub async fn probe<W>(
    writer: &Mutex<FramedWrite<W, JsonCodec<ControlRequest>>>,
    pongs: &mut mpsc::Receiver<u64>,
    token: u64,
    timeout: Duration,
) -> Liveness
where
    W: AsyncWrite + Unpin,
{
    let mut stale = 0usize;
    while pongs.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(stale, "Drained stale pongs before probe");
    }

    let exchange = async {
        {
            let mut w = writer.lock().await;
            if let Err(e) = w.send(ControlRequest::Ping { token }).await {
                tracing::warn!(error = %e, "Failed to send ping");
                return Liveness::Unresponsive;
            }
        }
        while let Some(received) = pongs.recv().await {
            if received == token {
                return Liveness::Alive;
            }
            tracing::trace!(received, expected = token, "Discarding unrelated pong");
        }
        // Mailbox closed: the supervisor is gone, so is the channel.
        Liveness::Unresponsive
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(liveness) => liveness,
        Err(_) => {
            tracing::warn!(
                token,
                timeout_ms = timeout.as_millis() as u64,
                "No pong within probe window"
            );
            Liveness::Unresponsive
        }
    }
}
