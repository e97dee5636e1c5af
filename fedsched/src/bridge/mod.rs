//! IPC bridge for scheduler-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the scheduler (parent) and a training worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ControlRequest, WorkerEvent)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
