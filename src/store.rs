//! On-disk checkpoint records.
//!
//! A checkpoint file holds one [`Value`]: nested maps and lists of
//! primitives and tensors. [`load`] and [`save`] are the only I/O primitives
//! the rest of the crate uses; the encoding behind them is postcard and
//! deliberately opaque to callers. `save` creates parent directories before
//! writing, so writers never have to prepare the output tree themselves.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConvertError;
use crate::tensor::Tensor;

/// One node of a checkpoint record tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    List(Vec<Value>),
    /// Insertion-ordered, so ordered manifests survive a round trip.
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Look up a key in a map value; `None` for other variants.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Look up a key that the schema requires to be present.
    pub fn require(&self, key: &str) -> Result<&Value> {
        self.get(key).ok_or_else(|| {
            ConvertError::MalformedCheckpoint(format!("missing key {key:?}")).into()
        })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// A non-negative integer, as required for degrees, offsets and shapes.
    pub fn expect_usize(&self, what: &str) -> Result<usize> {
        match self.as_int() {
            Some(v) if v >= 0 => Ok(v as usize),
            Some(v) => Err(ConvertError::MalformedCheckpoint(format!(
                "{what} must be non-negative, got {v}"
            ))
            .into()),
            None => Err(schema_error(what, "an integer", self)),
        }
    }

    pub fn expect_list(&self, what: &str) -> Result<&[Value]> {
        self.as_list().ok_or_else(|| schema_error(what, "a list", self))
    }

    pub fn expect_map(&self, what: &str) -> Result<&IndexMap<String, Value>> {
        self.as_map().ok_or_else(|| schema_error(what, "a map", self))
    }

    pub fn expect_tensor(&self, what: &str) -> Result<&Tensor> {
        self.as_tensor()
            .ok_or_else(|| schema_error(what, "a tensor", self))
    }

    /// Consume the value as a tensor, avoiding a copy of its data.
    pub fn into_tensor(self, what: &str) -> Result<Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(schema_error(what, "a tensor", &other)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "a bool",
            Value::Int(_) => "an integer",
            Value::Float(_) => "a float",
            Value::Str(_) => "a string",
            Value::Tensor(_) => "a tensor",
            Value::List(_) => "a list",
            Value::Map(_) => "a map",
        }
    }
}

fn schema_error(what: &str, expected: &str, got: &Value) -> anyhow::Error {
    ConvertError::MalformedCheckpoint(format!("{what} must be {expected}, got {}", got.kind()))
        .into()
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

/// Load a record from disk.
pub fn load(path: &Path) -> Result<Value> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read checkpoint record {}", path.display()))?;
    postcard::from_bytes(&bytes)
        .with_context(|| format!("failed to decode checkpoint record {}", path.display()))
}

/// Save a record to disk, creating parent directories as needed.
pub fn save(path: &Path, value: &Value) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let bytes = postcard::to_stdvec(value)
        .with_context(|| format!("failed to encode checkpoint record {}", path.display()))?;
    fs::write(path, bytes)
        .with_context(|| format!("failed to write checkpoint record {}", path.display()))
}
