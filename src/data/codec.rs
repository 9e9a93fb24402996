//! Record payload codec.
//!
//! A record payload is one JSON value. Mapping records are JSON objects
//! whose member slots encode as:
//! - `"|..."` — an inline string literal, sentinel stripped on decode
//! - any other JSON string — the hex address of a child mapping record
//! - a JSON array — an inline sequence, recursively composed of slots
//! - a JSON number, boolean or null — the inline scalar
//!
//! Mappings always occupy their own record and appear in their parent
//! only as an address; sequences and scalars are inlined.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::data::tree::ViewCore;
use crate::error::{Error, Result};
use crate::value::Value;

/// Prefix that marks a string slot as a literal rather than a reference.
pub(crate) const SENTINEL: char = '|';

/// Decode one record payload from its on-disk bytes.
pub(crate) fn decode_record(bytes: &[u8], addr: u64) -> Result<Json> {
    serde_json::from_slice(bytes).map_err(|err| Error::CorruptRecord {
        addr,
        reason: err.to_string(),
    })
}

/// Encode a string literal slot. The sentinel rescues contents that would
/// otherwise read as an address.
pub(crate) fn string_slot(s: &str) -> Json {
    Json::String(format!("{SENTINEL}{s}"))
}

/// Encode a child-record reference slot.
pub(crate) fn addr_slot(addr: u64) -> Json {
    Json::String(format!("{addr:x}"))
}

/// Resolve one slot of the record at `record_addr` into an in-memory
/// value, minting lazy child handles through `view`.
pub(crate) fn decode_slot(slot: &Json, view: &Arc<ViewCore>, record_addr: u64) -> Result<Value> {
    Ok(match slot {
        Json::String(s) => match s.strip_prefix(SENTINEL) {
            Some(literal) => Value::Str(literal.to_string()),
            None => {
                let addr = u64::from_str_radix(s, 16).map_err(|_| Error::CorruptRecord {
                    addr: record_addr,
                    reason: format!("invalid child reference {s:?}"),
                })?;
                Value::Map(ViewCore::handle(view, addr))
            }
        },
        Json::Array(items) => Value::Seq(
            items
                .iter()
                .map(|item| decode_slot(item, view, record_addr))
                .collect::<Result<_>>()?,
        ),
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(n.clone()),
        // The encoder never nests a mapping inside a record.
        Json::Object(_) => {
            return Err(Error::CorruptRecord {
                addr: record_addr,
                reason: "nested mapping object inside a record".to_string(),
            });
        }
    })
}
