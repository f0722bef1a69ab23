//! Primitive output types understood by schemas and sinks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a dataset or attribute in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Char,
    Str,
    /// Stored as `uint8` (0/1); kept distinct so inference can report it.
    Bool,
}

/// Storage class of a [`Dtype`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtypeClass {
    Float,
    Signed,
    Unsigned,
    Text,
}

impl Dtype {
    pub const ALL: [Dtype; 13] = [
        Dtype::Float32,
        Dtype::Float64,
        Dtype::Int8,
        Dtype::Int16,
        Dtype::Int32,
        Dtype::Int64,
        Dtype::UInt8,
        Dtype::UInt16,
        Dtype::UInt32,
        Dtype::UInt64,
        Dtype::Char,
        Dtype::Str,
        Dtype::Bool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::UInt8 => "uint8",
            Dtype::UInt16 => "uint16",
            Dtype::UInt32 => "uint32",
            Dtype::UInt64 => "uint64",
            Dtype::Char => "char",
            Dtype::Str => "str",
            Dtype::Bool => "bool",
        }
    }

    pub fn class(&self) -> DtypeClass {
        match self {
            Dtype::Float32 | Dtype::Float64 => DtypeClass::Float,
            Dtype::Int8 | Dtype::Int16 | Dtype::Int32 | Dtype::Int64 => DtypeClass::Signed,
            Dtype::UInt8 | Dtype::UInt16 | Dtype::UInt32 | Dtype::UInt64 | Dtype::Bool => {
                DtypeClass::Unsigned
            }
            Dtype::Char | Dtype::Str => DtypeClass::Text,
        }
    }

    pub fn is_text(&self) -> bool {
        self.class() == DtypeClass::Text
    }

    /// Inclusive integer range representable by this type, if it is an integer type.
    pub fn integer_range(&self) -> Option<(i128, i128)> {
        let range = match self {
            Dtype::Int8 => (i8::MIN as i128, i8::MAX as i128),
            Dtype::Int16 => (i16::MIN as i128, i16::MAX as i128),
            Dtype::Int32 => (i32::MIN as i128, i32::MAX as i128),
            Dtype::Int64 => (i64::MIN as i128, i64::MAX as i128),
            Dtype::UInt8 => (0, u8::MAX as i128),
            Dtype::UInt16 => (0, u16::MAX as i128),
            Dtype::UInt32 => (0, u32::MAX as i128),
            Dtype::UInt64 => (0, u64::MAX as i128),
            Dtype::Bool => (0, 1),
            _ => return None,
        };
        Some(range)
    }

    /// Maps a descriptor data-key `dtype` ("number", "integer", ...) to an output type.
    ///
    /// Output type names are accepted as well so sources that already speak in
    /// storage types pass through unchanged. For `array` sources a `dtype` in the
    /// dataset's `attrs` takes precedence over this default.
    pub fn from_source(source_dtype: &str) -> Option<Dtype> {
        match source_dtype {
            "number" => Some(Dtype::Float64),
            "integer" => Some(Dtype::Int64),
            "string" | "object" => Some(Dtype::Str),
            "boolean" => Some(Dtype::Bool),
            "array" => Some(Dtype::Float64),
            other => other.parse().ok(),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dtype::ALL
            .iter()
            .find(|dtype| dtype.as_str() == s)
            .copied()
            .ok_or_else(|| {
                format!(
                    "unknown dtype '{}', expected one of: {}",
                    s,
                    Dtype::ALL.map(|d| d.as_str()).join(", ")
                )
            })
    }
}
