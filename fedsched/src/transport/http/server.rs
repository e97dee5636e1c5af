//! Listener and lifecycle for the scheduler's HTTP front door.
//!
//! The server runs until the process is told to stop. Axum then stops
//! accepting connections and finishes in-flight requests. The scheduler
//! kills and reaps whatever training worker still holds the slot.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::scheduler::Scheduler;

use super::routes::{AppState, routes};

/// Address the HTTP API listens on.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// What ended the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownCause {
    Interrupt,
    Terminate,
    Endpoint,
}

/// Run the HTTP API for `scheduler` until shutdown, then stop its job.
pub async fn serve(config: ServerConfig, scheduler: Scheduler) -> anyhow::Result<()> {
    let state = AppState::new(scheduler.clone());
    let endpoint = state.shutdown_rx();

    let listener = TcpListener::bind(config.addr()?).await?;
    info!(addr = %listener.local_addr()?, "fedsched listening");

    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async move {
            let cause = wait_for_shutdown(endpoint).await;
            info!(?cause, "Draining HTTP connections");
        })
        .await?;

    scheduler.shutdown().await;
    info!("fedsched stopped");

    Ok(())
}

async fn wait_for_shutdown(mut endpoint: watch::Receiver<bool>) -> ShutdownCause {
    tokio::select! {
        () = interrupt() => ShutdownCause::Interrupt,
        () = terminate() => ShutdownCause::Terminate,
        () = requested(&mut endpoint) => ShutdownCause::Endpoint,
    }
}

/// Resolves on Ctrl+C. Never resolves if the handler can't be installed.
async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// Resolves once `POST /shutdown` flips the flag.
async fn requested(endpoint: &mut watch::Receiver<bool>) {
    let closed = endpoint.wait_for(|stop| *stop).await.is_err();
    if closed {
        // App state dropped without asking; let the signals decide.
        std::future::pending::<()>().await;
    }
}
