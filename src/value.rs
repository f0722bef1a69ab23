//! Values produced by placeholder resolution.

use crate::dtype::Dtype;
use crate::experiment::DataKey;
use serde_json::Value;

/// Timing information that travels with a post-run value.
#[derive(Debug, Clone, PartialEq)]
pub enum Timestamps {
    /// Value collected over events: one component timestamp and one event time per event.
    Events { component: Vec<f64>, events: Vec<f64> },
    /// Value taken from a descriptor's configuration snapshot.
    Descriptor(f64),
}

/// A resolved raw value together with its (possibly inferred) type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    pub raw: Value,
    /// Type declared by the source, or inferred from the raw value.
    pub dtype: Option<Dtype>,
    pub shape: Vec<usize>,
    /// Data-key description when the value came from a descriptor.
    pub description: Option<DataKey>,
    pub timestamps: Option<Timestamps>,
}

impl ResolvedValue {
    /// Wrap a raw value, inferring its type from its JSON kind.
    pub fn new(raw: Value) -> Self {
        let dtype = infer_dtype(&raw);
        Self::with_dtype(raw, dtype)
    }

    pub fn with_dtype(raw: Value, dtype: Option<Dtype>) -> Self {
        let shape = shape_of(&raw);
        Self {
            raw,
            dtype,
            shape,
            description: None,
            timestamps: None,
        }
    }

    pub fn described_by(mut self, key: DataKey) -> Self {
        self.description = Some(key);
        self
    }

    pub fn timed(mut self, timestamps: Timestamps) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    /// Replace the raw value, keeping the description and timestamps.
    pub fn replace_raw(mut self, raw: Value, dtype: Option<Dtype>) -> Self {
        self.shape = shape_of(&raw);
        self.raw = raw;
        self.dtype = dtype;
        self
    }
}

/// Shape of a (possibly nested) JSON array; scalars and ragged arrays stop descending.
pub fn shape_of(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        let Some(first) = items.first() else { break };
        let inner = shape_of(first);
        if items.iter().skip(1).any(|item| shape_of(item) != inner) {
            break;
        }
        current = first;
    }
    shape
}

/// Type implied by the JSON kind of a value.
///
/// Arrays take the widest element type (booleans < integers < floats); any text
/// element makes the whole array text. `null` has no type.
pub fn infer_dtype(value: &Value) -> Option<Dtype> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(Dtype::Bool),
        Value::Number(n) if n.is_f64() => Some(Dtype::Float64),
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => Some(Dtype::UInt64),
        Value::Number(_) => Some(Dtype::Int64),
        Value::String(_) | Value::Object(_) => Some(Dtype::Str),
        Value::Array(items) => {
            let mut widest: Option<Dtype> = None;
            for item in items {
                let dtype = infer_dtype(item)?;
                widest = Some(match (widest, dtype) {
                    (None, d) => d,
                    (Some(Dtype::Str), _) | (_, Dtype::Str) => Dtype::Str,
                    (Some(Dtype::Float64), _) | (_, Dtype::Float64) => Dtype::Float64,
                    (Some(Dtype::UInt64), _) | (_, Dtype::UInt64) => Dtype::UInt64,
                    (Some(Dtype::Int64), _) | (_, Dtype::Int64) => Dtype::Int64,
                    (Some(current), _) => current,
                });
            }
            widest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_of() {
        assert_eq!(shape_of(&json!(1.5)), Vec::<usize>::new());
        assert_eq!(shape_of(&json!([1, 2, 3])), vec![3]);
        assert_eq!(shape_of(&json!([[1, 2], [3, 4], [5, 6]])), vec![3, 2]);
        assert_eq!(shape_of(&json!([[1, 2], [3]])), vec![2]);
        assert_eq!(shape_of(&json!([])), vec![0]);
    }

    #[test]
    fn test_infer_dtype() {
        assert_eq!(infer_dtype(&json!(true)), Some(Dtype::Bool));
        assert_eq!(infer_dtype(&json!(7)), Some(Dtype::Int64));
        assert_eq!(infer_dtype(&json!(7.5)), Some(Dtype::Float64));
        assert_eq!(infer_dtype(&json!("x")), Some(Dtype::Str));
        assert_eq!(infer_dtype(&json!({"a": 1})), Some(Dtype::Str));
        assert_eq!(infer_dtype(&json!([1, 2.5])), Some(Dtype::Float64));
        assert_eq!(infer_dtype(&json!([true, 2])), Some(Dtype::Int64));
        assert_eq!(infer_dtype(&json!(["a", 1])), Some(Dtype::Str));
        assert_eq!(infer_dtype(&json!(null)), None);
    }
}
