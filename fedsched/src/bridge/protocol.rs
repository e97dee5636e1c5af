//! Wire protocol types for scheduler-worker communication.
//!
//! One channel per job, carried over the worker's stdin (requests) and
//! stdout (events). Every message is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::model::{ModelId, Tensor};

/// Everything the worker needs to start its training server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub model: ModelId,
    /// Seed parameters; empty means the server picks its own initial values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_params: Vec<Tensor>,
    pub config: TrainingConfig,
    pub port: u16,
}

/// Control messages from scheduler to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Liveness probe; the worker must answer with a `Pong` carrying the same token.
    Ping { token: u64 },

    /// Start the training server. Sent once, right after spawn.
    ServerRequest(ServerSpec),
}

/// Lifecycle and result events from worker to scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Pong {
        token: u64,
    },

    /// Aggregated parameters from one completed round.
    SaveParams {
        params: Vec<Tensor>,
    },

    /// Training run finished (all rounds ran or the server stopped cleanly).
    Done,

    /// Something went wrong on the worker side. Not terminal by itself.
    Error {
        message: String,
    },
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pong { .. } => "pong",
            Self::SaveParams { .. } => "save_params",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ping_serializes() {
        let req = ControlRequest::Ping { token: 7 };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "ping",
          "token": 7
        }
        "#);
    }

    #[test]
    fn control_server_request_serializes() {
        let req = ControlRequest::ServerRequest(ServerSpec {
            model: ModelId(7),
            initial_params: vec![Tensor::new(vec![1], vec![3.0])],
            config: TrainingConfig::default(),
            port: 8080,
        });
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "server_request",
          "model": 7,
          "initial_params": [
            {
              "shape": [
                1
              ],
              "data": "AABAQA=="
            }
          ],
          "config": {
            "num_rounds": 10,
            "batch_size": 32,
            "local_epochs": 5,
            "fraction_fit": 1.0,
            "fraction_evaluate": 1.0,
            "min_fit_clients": 2,
            "min_evaluate_clients": 2,
            "min_available_clients": 2
          },
          "port": 8080
        }
        "#);
    }

    #[test]
    fn server_request_without_params_omits_them() {
        let req = ControlRequest::ServerRequest(ServerSpec {
            model: ModelId(7),
            initial_params: vec![],
            config: TrainingConfig::default(),
            port: 8080,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("initial_params").is_none());

        let back: ControlRequest = serde_json::from_value(json).unwrap();
        match back {
            ControlRequest::ServerRequest(spec) => assert!(spec.initial_params.is_empty()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn worker_done_serializes() {
        insta::assert_json_snapshot!(WorkerEvent::Done, @r#"
        {
          "type": "done"
        }
        "#);
    }

    #[test]
    fn worker_error_serializes() {
        let event = WorkerEvent::Error {
            message: "not enough clients".to_string(),
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "error",
          "message": "not enough clients"
        }
        "#);
    }

    #[test]
    fn save_params_requires_a_list() {
        let result =
            serde_json::from_str::<WorkerEvent>(r#"{"type":"save_params","params":{"a":1}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn event_kinds() {
        assert_eq!(WorkerEvent::Pong { token: 1 }.kind(), "pong");
        assert_eq!(WorkerEvent::Done.kind(), "done");
        assert_eq!(
            WorkerEvent::SaveParams { params: vec![] }.kind(),
            "save_params"
        );
    }
}
