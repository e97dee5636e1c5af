//! fedsched HTTP server.
//!
//! Configuration comes from the environment:
//! - `FEDSCHED_WORKER`: worker command line (required)
//! - `FEDSCHED_HOST` / `FEDSCHED_HTTP_PORT`: HTTP listen address
//! - `FEDSCHED_TRAIN_PORT`: port handed to the worker's training server
//! - `FEDSCHED_DATA_DIR`: root of the filesystem store
//! - `FEDSCHED_TIMEOUT_SECS`: ceiling on one training run
//! - `FEDSCHED_NUM_ROUNDS`: federated rounds per run
//! - `FEDSCHED_LOG` / `RUST_LOG` / `LOG_FORMAT`: logging

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fedsched::transport::{ServerConfig, serve};
use fedsched::{
    CommandSpawner, DEFAULT_JOB_TIMEOUT, DEFAULT_TRAINING_PORT, FsStore, Scheduler,
    SchedulerConfig, TrainingConfig,
};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("FEDSCHED_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("fedsched={level},fedsched_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

/// Parse `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let worker = std::env::var("FEDSCHED_WORKER").context("FEDSCHED_WORKER is not set")?;
    let spawner = CommandSpawner::from_command_line(&worker)
        .context("FEDSCHED_WORKER is empty")?;

    let server = ServerConfig {
        host: env_or("FEDSCHED_HOST", ServerConfig::default().host)?,
        port: env_or("FEDSCHED_HTTP_PORT", ServerConfig::default().port)?,
    };
    let data_dir: String = env_or("FEDSCHED_DATA_DIR", "./data".to_string())?;
    let timeout_secs = env_or("FEDSCHED_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT.as_secs())?;
    let num_rounds = env_or("FEDSCHED_NUM_ROUNDS", TrainingConfig::default().num_rounds)?;

    let config = SchedulerConfig::new(Arc::new(spawner))
        .with_port(env_or("FEDSCHED_TRAIN_PORT", DEFAULT_TRAINING_PORT)?)
        .with_job_timeout(Duration::from_secs(timeout_secs))
        .with_training(TrainingConfig::default().with_num_rounds(num_rounds));
    tracing::info!(?config, worker = %worker, data_dir = %data_dir, "Loaded configuration");

    let store = FsStore::open(&data_dir)
        .await
        .with_context(|| format!("failed to open store at {data_dir}"))?;

    serve(server, Scheduler::new(config, Arc::new(store))).await
}
