//! Domain records shared by the scheduler, the wire protocol and the stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

record_id!(
    /// Identity of a trainable model in the registry.
    ModelId
);
record_id!(
    /// Identity of a persisted training session.
    SessionId
);
record_id!(ParamsId);

/// Registry entry for a model that clients may train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub name: String,
}

impl Model {
    pub fn new(id: impl Into<ModelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One parameter tensor: row-major `f32` values plus their shape.
///
/// Serialized with `data` as base64 of little-endian bytes so large layers
/// don't balloon into JSON number arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    #[serde(with = "f32_base64")]
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Number of elements implied by `shape`, or `None` if it overflows.
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// True when `shape` describes exactly `data.len()` values.
    pub fn is_consistent(&self) -> bool {
        self.numel() == Some(self.data.len())
    }
}

mod f32_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(D::Error::custom(format!(
                "tensor data is {} bytes, not a multiple of 4",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Immutable snapshot of aggregated parameters for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub id: ParamsId,
    pub model: ModelId,
    pub params: Vec<Tensor>,
    pub created_at: DateTime<Utc>,
}

/// Start/end bookkeeping for one training run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub model: ModelId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_data_serializes_as_base64() {
        let tensor = Tensor::new(vec![2], vec![1.0, 2.0]);
        insta::assert_json_snapshot!(tensor, @r#"
        {
          "shape": [
            2
          ],
          "data": "AACAPwAAAEA="
        }
        "#);
    }

    #[test]
    fn tensor_deserializes_from_base64() {
        let tensor: Tensor =
            serde_json::from_str(r#"{"shape":[2,2],"data":"AACAPwAAAEAAAEBAAACAQA=="}"#).unwrap();
        assert_eq!(tensor.data, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(tensor.is_consistent());
    }

    #[test]
    fn tensor_rejects_truncated_data() {
        let result = serde_json::from_str::<Tensor>(r#"{"shape":[1],"data":"AAA="}"#);
        assert!(result.is_err());
    }

    #[test]
    fn tensor_shape_mismatch_is_inconsistent() {
        let tensor = Tensor::new(vec![3], vec![1.0, 2.0]);
        assert_eq!(tensor.numel(), Some(3));
        assert!(!tensor.is_consistent());
    }

    #[test]
    fn overflowing_shape_is_inconsistent() {
        let tensor = Tensor::new(vec![usize::MAX, 2], vec![]);
        assert_eq!(tensor.numel(), None);
        assert!(!tensor.is_consistent());

        let wraps_to_zero = Tensor::new(vec![1 << (usize::BITS / 2), 1 << (usize::BITS / 2)], vec![]);
        assert!(!wraps_to_zero.is_consistent());
    }

    #[test]
    fn ids_are_transparent() {
        assert_eq!(serde_json::to_string(&ModelId(7)).unwrap(), "7");
        assert_eq!(
            serde_json::from_str::<SessionId>("12").unwrap(),
            SessionId(12)
        );
        assert_eq!(ModelId(9).to_string(), "9");
    }
}
