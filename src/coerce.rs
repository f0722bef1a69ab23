//! Coercion of resolved values into typed output values.
//!
//! Two entry points:
//!
//! - [`coerce_attr`] infers the output type from the value itself and is used
//!   for user-defined `attrs`, which never declare a dtype.
//! - [`coerce_with_dtype`] casts to a declared dtype and fails when the value
//!   cannot be represented exactly (non-numeric text to a number, a fraction
//!   to an integer, an integer outside the type's range).
//!
//! | value                        | inferred output                       |
//! |------------------------------|---------------------------------------|
//! | mapping                      | text, canonical JSON                  |
//! | text                         | text                                  |
//! | integer                      | int64                                 |
//! | float                        | float64                               |
//! | boolean                      | bool (stored as uint8 0/1)            |
//! | list of numbers/booleans     | numeric array, widest element type    |
//! | list of text                 | text array                            |
//! | ragged or mixed list         | text, canonical JSON                  |

use crate::dtype::{Dtype, DtypeClass};
use crate::error::CoercionError;
use crate::value::{infer_dtype, shape_of};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;

/// Element storage of a [`TypedValue`], row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Text(Vec<String>),
}

impl TypedData {
    pub fn len(&self) -> usize {
        match self {
            TypedData::Float(v) => v.len(),
            TypedData::Int(v) => v.len(),
            TypedData::UInt(v) => v.len(),
            TypedData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn element(&self, index: usize) -> Value {
        match self {
            TypedData::Float(v) => Value::from(v[index]),
            TypedData::Int(v) => Value::from(v[index]),
            TypedData::UInt(v) => Value::from(v[index]),
            TypedData::Text(v) => Value::from(v[index].clone()),
        }
    }
}

/// A value ready to be written: element type, shape and data.
///
/// Scalars have an empty shape and exactly one element.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: TypedData,
}

impl TypedValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            dtype: Dtype::Str,
            shape: Vec::new(),
            data: TypedData::Text(vec![value.into()]),
        }
    }

    pub fn float(value: f64) -> Self {
        Self {
            dtype: Dtype::Float64,
            shape: Vec::new(),
            data: TypedData::Float(vec![value]),
        }
    }

    pub fn int(value: i64) -> Self {
        Self {
            dtype: Dtype::Int64,
            shape: Vec::new(),
            data: TypedData::Int(vec![value]),
        }
    }

    pub fn text_array(values: Vec<String>) -> Self {
        Self {
            dtype: Dtype::Str,
            shape: vec![values.len()],
            data: TypedData::Text(values),
        }
    }

    pub fn float_array(values: Vec<f64>) -> Self {
        Self {
            dtype: Dtype::Float64,
            shape: vec![values.len()],
            data: TypedData::Float(values),
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.data {
            TypedData::Text(values) if self.is_scalar() => values.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if !self.is_scalar() {
            return None;
        }
        match &self.data {
            TypedData::Float(v) => v.first().copied(),
            TypedData::Int(v) => v.first().map(|x| *x as f64),
            TypedData::UInt(v) => v.first().map(|x| *x as f64),
            TypedData::Text(_) => None,
        }
    }

    /// Nested JSON rendering following `shape`.
    pub fn to_json(&self) -> Value {
        let mut index = 0;
        self.nest(0, &mut index)
    }

    fn nest(&self, depth: usize, index: &mut usize) -> Value {
        match self.shape.get(depth) {
            None => {
                if *index >= self.data.len() {
                    return Value::Null;
                }
                let value = self.data.element(*index);
                *index += 1;
                if self.dtype == Dtype::Bool {
                    Value::Bool(value.as_u64() == Some(1))
                } else {
                    value
                }
            }
            Some(len) => Value::Array((0..*len).map(|_| self.nest(depth + 1, index)).collect()),
        }
    }
}

/// Coerce a user-defined attribute value, inferring its type.
pub fn coerce_attr(value: &Value) -> Result<TypedValue, CoercionError> {
    match value {
        Value::Null => Err(error(value, "attr", "null has no output representation")),
        Value::Object(_) => Ok(TypedValue::text(canonical_json(value))),
        Value::Array(_) => {
            let shape = shape_of(value);
            let Some(leaves) = flatten(value, shape.len()) else {
                return Ok(TypedValue::text(canonical_json(value)));
            };
            match infer_dtype(value) {
                Some(Dtype::Str) if leaves.iter().all(|leaf| leaf.is_string()) => {
                    cast(value, &leaves, shape, Dtype::Str)
                }
                Some(Dtype::Str) | None if !leaves.is_empty() => {
                    Ok(TypedValue::text(canonical_json(value)))
                }
                Some(dtype) => cast(value, &leaves, shape, dtype),
                None => cast(value, &leaves, shape, Dtype::Float64),
            }
        }
        scalar => {
            let dtype = infer_dtype(scalar).unwrap_or(Dtype::Str);
            coerce_with_dtype(scalar, dtype)
        }
    }
}

/// Cast a resolved value to `dtype`.
pub fn coerce_with_dtype(value: &Value, dtype: Dtype) -> Result<TypedValue, CoercionError> {
    if let Value::Object(_) = value {
        if dtype.is_text() {
            return Ok(TypedValue::text(canonical_json(value)));
        }
        return Err(error(value, dtype.as_str(), "a mapping can only be stored as text"));
    }

    let shape = shape_of(value);
    let leaves = flatten(value, shape.len())
        .ok_or_else(|| error(value, dtype.as_str(), "ragged or mixed nesting"))?;
    cast(value, &leaves, shape, dtype)
}

fn cast(
    original: &Value,
    leaves: &[&Value],
    shape: Vec<usize>,
    dtype: Dtype,
) -> Result<TypedValue, CoercionError> {
    let fail = |reason: String| error(original, dtype.as_str(), &reason);

    let data = match dtype.class() {
        DtypeClass::Text => TypedData::Text(
            leaves
                .iter()
                .map(|leaf| to_text(leaf).ok_or_else(|| fail("null cannot be stored as text".into())))
                .collect::<Result<_, _>>()?,
        ),
        DtypeClass::Float => TypedData::Float(
            leaves
                .iter()
                .map(|leaf| {
                    let number = to_f64(leaf).map_err(&fail)?;
                    if dtype == Dtype::Float32 && number.is_finite() && number.abs() > f32::MAX as f64 {
                        return Err(fail(format!("{} is outside the float32 range", number)));
                    }
                    Ok(number)
                })
                .collect::<Result<_, _>>()?,
        ),
        DtypeClass::Signed | DtypeClass::Unsigned => {
            let (min, max) = dtype.integer_range().unwrap_or((i64::MIN as i128, i64::MAX as i128));
            let integers = leaves
                .iter()
                .map(|leaf| {
                    let integer = to_i128(leaf).map_err(&fail)?;
                    if integer < min || integer > max {
                        Err(fail(format!("{} is outside the {} range", integer, dtype)))
                    } else {
                        Ok(integer)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            if dtype.class() == DtypeClass::Signed {
                TypedData::Int(integers.into_iter().map(|i| i as i64).collect())
            } else {
                TypedData::UInt(integers.into_iter().map(|i| i as u64).collect())
            }
        }
    };

    Ok(TypedValue { dtype, shape, data })
}

/// Elements of `value` at nesting depth `depth`, or `None` if the nesting is irregular.
fn flatten(value: &Value, depth: usize) -> Option<Vec<&Value>> {
    let mut leaves = Vec::new();
    collect_leaves(value, depth, &mut leaves).then_some(leaves)
}

fn collect_leaves<'a>(value: &'a Value, depth: usize, leaves: &mut Vec<&'a Value>) -> bool {
    match (value, depth) {
        (Value::Array(_), 0) => false,
        (Value::Object(_), 0) => false,
        (leaf, 0) => {
            leaves.push(leaf);
            true
        }
        (Value::Array(items), _) => items
            .iter()
            .all(|item| collect_leaves(item, depth - 1, leaves)),
        _ => false,
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
        other => Some(other.to_string()),
    }
}

fn to_f64(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{} is not representable", n)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not numeric text", text)),
        other => Err(format!("{} is not numeric", other)),
    }
}

fn to_i128(value: &Value) -> Result<i128, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ok(u as i128)
            } else {
                float_to_integer(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::Bool(b) => Ok(i128::from(*b)),
        Value::String(text) => {
            let text = text.trim();
            match text.parse::<i128>() {
                Ok(i) => Ok(i),
                Err(_) => text
                    .parse::<f64>()
                    .map_err(|_| format!("'{}' is not numeric text", text))
                    .and_then(float_to_integer),
            }
        }
        other => Err(format!("{} is not numeric", other)),
    }
}

fn float_to_integer(value: f64) -> Result<i128, String> {
    if !value.is_finite() {
        return Err(format!("{} is not finite", value));
    }
    if value.fract() != 0.0 {
        return Err(format!("{} has a fractional part", value));
    }
    if value.abs() >= 1.8e19 {
        return Err(format!("{} is too large for an integer", value));
    }
    Ok(value as i128)
}

fn error(value: &Value, dtype: &str, reason: &str) -> CoercionError {
    CoercionError {
        value: value.to_string(),
        dtype: dtype.to_string(),
        reason: reason.to_string(),
    }
}

/// JSON with sorted keys and `", "` / `": "` separators on one line.
pub fn canonical_json(value: &Value) -> String {
    let sorted = sort_keys(value);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, SpacedFormatter);
    if sorted.serialize(&mut serializer).is_err() {
        return value.to_string();
    }
    String::from_utf8(out).unwrap_or_else(|_| value.to_string())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sort_keys(v))).collect();
            let mut out = Map::new();
            for (key, value) in sorted {
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapping_becomes_canonical_text() {
        let out = coerce_attr(&json!({"a": "2"})).unwrap();
        assert_eq!(out.as_text(), Some(r#"{"a": "2"}"#));

        let out = coerce_attr(&json!({"b": [1, 2], "a": {"z": 1, "y": true}})).unwrap();
        assert_eq!(
            out.as_text(),
            Some(r#"{"a": {"y": true, "z": 1}, "b": [1, 2]}"#)
        );
    }

    #[test]
    fn test_float_list_becomes_float64_array() {
        let out = coerce_attr(&json!([1.02, 3.04, 5.06])).unwrap();
        assert_eq!(out.dtype, Dtype::Float64);
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.data, TypedData::Float(vec![1.02, 3.04, 5.06]));
        assert_eq!(out.to_json(), json!([1.02, 3.04, 5.06]));
    }

    #[test]
    fn test_inferred_scalars() {
        assert_eq!(coerce_attr(&json!("keV")).unwrap(), TypedValue::text("keV"));
        assert_eq!(coerce_attr(&json!(5)).unwrap(), TypedValue::int(5));
        assert_eq!(coerce_attr(&json!(3.1415)).unwrap(), TypedValue::float(3.1415));

        let flag = coerce_attr(&json!(true)).unwrap();
        assert_eq!(flag.dtype, Dtype::Bool);
        assert_eq!(flag.data, TypedData::UInt(vec![1]));
        assert_eq!(flag.to_json(), json!(true));

        assert!(coerce_attr(&json!(null)).is_err());
    }

    #[test]
    fn test_inferred_sequences() {
        let out = coerce_attr(&json!([1, 2.5])).unwrap();
        assert_eq!(out, TypedValue::float_array(vec![1.0, 2.5]));

        let out = coerce_attr(&json!([5, 6, 7])).unwrap();
        assert_eq!(out.dtype, Dtype::Int64);
        assert_eq!(out.data, TypedData::Int(vec![5, 6, 7]));

        let out = coerce_attr(&json!(["Mo", "We"])).unwrap();
        assert_eq!(out, TypedValue::text_array(vec!["Mo".into(), "We".into()]));

        let out = coerce_attr(&json!([[1, 2], [3, 4]])).unwrap();
        assert_eq!(out.shape, vec![2, 2]);
        assert_eq!(out.to_json(), json!([[1, 2], [3, 4]]));

        let out = coerce_attr(&json!([1, "a"])).unwrap();
        assert_eq!(out.as_text(), Some(r#"[1, "a"]"#));

        let out = coerce_attr(&json!([[1, 2], [3]])).unwrap();
        assert_eq!(out.as_text(), Some("[[1, 2], [3]]"));

        let out = coerce_attr(&json!([])).unwrap();
        assert_eq!(out.shape, vec![0]);
    }

    #[test]
    fn test_explicit_dtype() {
        let out = coerce_with_dtype(&json!(7.5), Dtype::Float64).unwrap();
        assert_eq!(out, TypedValue::float(7.5));

        let out = coerce_with_dtype(&json!("12"), Dtype::Int32).unwrap();
        assert_eq!(out.data, TypedData::Int(vec![12]));
        assert_eq!(out.dtype, Dtype::Int32);

        let out = coerce_with_dtype(&json!(3.0), Dtype::UInt8).unwrap();
        assert_eq!(out.data, TypedData::UInt(vec![3]));

        let out = coerce_with_dtype(&json!(7.5), Dtype::Str).unwrap();
        assert_eq!(out.as_text(), Some("7.5"));

        let out = coerce_with_dtype(&json!([0, 1, 0]), Dtype::Int64).unwrap();
        assert_eq!(out.shape, vec![3]);
    }

    #[test]
    fn test_explicit_dtype_failures() {
        let err = coerce_with_dtype(&json!("abc"), Dtype::Float64).unwrap_err();
        assert_eq!(err.dtype, "float64");
        assert!(err.reason.contains("not numeric"));

        assert!(coerce_with_dtype(&json!(300), Dtype::Int8).is_err());
        assert!(coerce_with_dtype(&json!(-1), Dtype::UInt32).is_err());
        assert!(coerce_with_dtype(&json!(2.5), Dtype::Int64).is_err());
        assert!(coerce_with_dtype(&json!({"a": 1}), Dtype::Float64).is_err());
        assert!(coerce_with_dtype(&json!([[1], [2, 3]]), Dtype::Float64).is_err());
        assert!(coerce_with_dtype(&json!(1e300), Dtype::Float32).is_err());
    }
}
