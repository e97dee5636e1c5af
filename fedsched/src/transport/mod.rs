//! Transport layer for fedsched.
//!
//! HTTP via axum is the only caller-facing transport. It maps requests onto
//! [`Scheduler`](crate::scheduler::Scheduler) and carries no logic of its own.

pub mod http;

pub use http::{ServerConfig, serve};
