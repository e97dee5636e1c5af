//! HTTP transport: route handlers and the server loop.

mod routes;
mod server;

pub use routes::{AppState, HealthCheckResponse, HealthStatus, TrainServerRequest, routes};
pub use server::{ServerConfig, serve};
