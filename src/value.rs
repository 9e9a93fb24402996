//! The logical value universe stored in a database.
//!
//! A [`Value`] is either a scalar (null, boolean, number, string), an
//! inline sequence, or a mapping. Mappings are represented by [`Node`]
//! handles so that subtrees load lazily from disk and mutations made
//! through a child handle are visible through its parent.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Number;

use crate::data::tree::Node;
use crate::error::{Error, Result};

/// One value slot in the tree.
///
/// Sequences are plain vectors: they are stored inline in their parent
/// record and are copied out whole by [`Node::get`]. Mappings are shared
/// handles; cloning a `Value::Map` clones the handle, not the subtree.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    Str(String),
    Seq(Vec<Value>),
    Map(Node),
}

impl Value {
    /// A short name for the value's shape, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
        }
    }

    /// Borrow the mapping handle, or fail with [`Error::WrongType`].
    pub fn as_map(&self) -> Result<&Node> {
        match self {
            Value::Map(node) => Ok(node),
            other => Err(Error::WrongType {
                expected: "mapping",
                found: other.kind(),
            }),
        }
    }

    /// Borrow the sequence elements, or fail with [`Error::WrongType`].
    pub fn as_seq(&self) -> Result<&[Value]> {
        match self {
            Value::Seq(items) => Ok(items),
            other => Err(Error::WrongType {
                expected: "sequence",
                found: other.kind(),
            }),
        }
    }

    /// Borrow the string contents, or fail with [`Error::WrongType`].
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(Error::WrongType {
                expected: "string",
                found: other.kind(),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Build a detached value tree from plain JSON. Objects become
    /// detached [`Node`]s that can later be assigned into a transaction.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Seq(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => {
                let map: BTreeMap<String, Value> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Value::Map(Node::from_entries(map))
            }
        }
    }

    /// Deep-copy this value into plain JSON, materializing any mapping
    /// handles it reaches. The result is fully detached from the database.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Seq(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_>>()?,
            ),
            Value::Map(node) => node.to_json()?,
        })
    }

    /// Convert any serde-serializable type into a detached value tree.
    pub fn from_serde<T: Serialize>(value: &T) -> Result<Value> {
        Ok(Value::from_json(&serde_json::to_value(value)?))
    }

    /// Deserialize this value (deep-copied out of the database) into a
    /// serde-deserializable type.
    pub fn into_serde<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Number(Number::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(Number::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::Number(Number::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        // Non-finite floats have no JSON form and collapse to null.
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Value {
        Value::Seq(items)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Value {
        Value::Map(node)
    }
}
