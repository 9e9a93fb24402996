//! The structural diff that turns a commit into the minimum set of
//! appended records.
//!
//! `write_changes` walks the candidate tree against the committed tree in
//! post-order. Each subtree resolves to either the address it already has
//! on disk (unchanged, or an unmaterialized handle that cannot have
//! changed) or to a freshly appended record. Parents see only the
//! resolved slot, so an unchanged child costs nothing and a changed child
//! forces new records exactly along its path to the root.
//!
//! Identity is by address, never by in-memory reference. A handle from an
//! older view of the same database is a legal reference inside a later
//! transaction; a handle from another database (as during compaction) is
//! walked and copied like any detached value.
//!
//! Records appended during one pass are deduplicated by BLAKE3 content
//! hash, so identical subtrees written in the same transaction collapse
//! to a single address.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::data::{DbCore, codec};
use crate::data::tree::Node;
use crate::error::Result;
use crate::value::Value;

pub(crate) struct DiffWriter<'a> {
    db: &'a Arc<DbCore>,
    /// Payload hash to address, for records appended in this pass.
    dedup: HashMap<[u8; 32], u64>,
}

impl<'a> DiffWriter<'a> {
    /// Diff `new_root` against `old_root`, appending records for every
    /// changed subtree. Returns the address to publish as the new root,
    /// or `None` when nothing changed.
    pub(crate) fn write_changes(
        db: &'a Arc<DbCore>,
        old_root: &Node,
        new_root: &Node,
    ) -> Result<Option<u64>> {
        let mut writer = DiffWriter {
            db,
            dedup: HashMap::new(),
        };
        let old = Value::Map(old_root.clone());
        let (addr, same) = writer.diff_map(Some(&old), new_root)?;
        Ok(if same { None } else { Some(addr) })
    }

    /// Resolve a mapping to a record address. `old` is the value the
    /// committed tree holds at the same position, if any.
    fn diff_map(&mut self, old: Option<&Value>, node: &Node) -> Result<(u64, bool)> {
        // An unmaterialized handle of this database cannot have been
        // mutated; its record is reused verbatim.
        if let Some(addr) = node.addr_in(self.db) {
            if !node.is_materialized() {
                let same =
                    matches!(old, Some(Value::Map(o)) if o.addr_in(self.db) == Some(addr));
                return Ok((addr, same));
            }
        }

        let old_node = match old {
            Some(Value::Map(o)) => Some(o),
            _ => None,
        };
        let mut all_same = old_node.is_some();

        let entries = node.entries()?;
        if let Some(o) = old_node {
            if o.len()? != entries.len() {
                all_same = false;
            }
        }

        let mut payload = serde_json::Map::new();
        for (key, new_value) in &entries {
            let old_value = match old_node {
                Some(o) => o.get(key)?,
                None => None,
            };
            let (slot, same) = self.compare_and_write(old_value.as_ref(), new_value)?;
            payload.insert(key.clone(), slot);
            all_same = all_same && same;
        }

        // Every entry matched and the sizes agree: the committed record
        // already describes this subtree.
        if all_same {
            if let Some(addr) = old_node.and_then(|o| o.addr_in(self.db)) {
                return Ok((addr, true));
            }
        }

        let addr = self.append(Json::Object(payload))?;
        Ok((addr, all_same))
    }

    /// Resolve one value to the slot its parent record stores, plus
    /// whether it is identical to `old`.
    fn compare_and_write(&mut self, old: Option<&Value>, new: &Value) -> Result<(Json, bool)> {
        match new {
            Value::Map(node) => {
                let (addr, same) = self.diff_map(old, node)?;
                Ok((codec::addr_slot(addr), same))
            }
            Value::Str(s) => {
                let same = matches!(old, Some(Value::Str(o)) if o == s);
                Ok((codec::string_slot(s), same))
            }
            Value::Seq(items) => self.diff_seq(old, items),
            Value::Null => Ok((Json::Null, matches!(old, Some(Value::Null)))),
            Value::Bool(b) => {
                let same = matches!(old, Some(Value::Bool(o)) if o == b);
                Ok((Json::Bool(*b), same))
            }
            Value::Number(n) => {
                let same = matches!(old, Some(Value::Number(o)) if o == n);
                Ok((Json::Number(n.clone()), same))
            }
        }
    }

    fn diff_seq(&mut self, old: Option<&Value>, items: &[Value]) -> Result<(Json, bool)> {
        let old_items: &[Value] = match old {
            Some(Value::Seq(v)) => v,
            _ => &[],
        };
        let mut all_same = matches!(old, Some(Value::Seq(_)));
        if old_items.len() != items.len() {
            all_same = false;
        }

        let mut slots = Vec::with_capacity(items.len());
        for (idx, new_value) in items.iter().enumerate() {
            // Indexes past the end of the old sequence compare against null.
            let old_value = old_items.get(idx).unwrap_or(&Value::Null);
            let (slot, same) = self.compare_and_write(Some(old_value), new_value)?;
            all_same = all_same && same;
            slots.push(slot);
        }
        Ok((Json::Array(slots), all_same))
    }

    /// Append a record payload, collapsing payloads identical to one
    /// already appended in this pass onto the same address.
    fn append(&mut self, payload: Json) -> Result<u64> {
        let bytes = serde_json::to_vec(&payload)?;
        let digest = *blake3::hash(&bytes).as_bytes();
        if let Some(&addr) = self.dedup.get(&digest) {
            return Ok(addr);
        }
        let addr = self.db.store.append_record(&bytes)?;
        self.dedup.insert(digest, addr);
        Ok(addr)
    }
}
