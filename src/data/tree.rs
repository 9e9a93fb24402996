//! Views and lazy mapping handles.
//!
//! A view is a snapshot anchored at a root address, with a per-view cache
//! from address to live handle. Read views cache weakly so long-lived
//! snapshots over large databases stay bounded: a reclaimed handle is
//! simply re-minted on the next access. The write view caches strongly,
//! because mutations live on handles and must survive until commit.
//!
//! A handle starts unmaterialized. The first entry access reads its
//! record and resolves every slot: literal strings lose their sentinel,
//! addresses become further lazy handles, sequences decode in place.
//! Mutating an entry materializes first and then edits the in-memory
//! state; the handle keeps the address it was born at so the commit diff
//! can recognize unchanged subtrees and reuse their records.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::data::{DbCore, codec, lock};
use crate::error::{Error, Result};
use crate::value::Value;

/// One snapshot over the database: a root address plus the handle cache.
pub(crate) struct ViewCore {
    pub(crate) db: Arc<DbCore>,
    root_addr: u64,
    writable: bool,
    cache: Mutex<HandleCache>,
}

enum HandleCache {
    /// Read views: handles are reclaimable; re-reading an address mints an
    /// equivalent handle.
    Weak(HashMap<u64, Weak<NodeInner>>),
    /// The write view: handles carry transaction state until commit.
    Strong(HashMap<u64, Arc<NodeInner>>),
}

impl ViewCore {
    pub(crate) fn read(db: Arc<DbCore>, root_addr: u64) -> Arc<ViewCore> {
        Arc::new(ViewCore {
            db,
            root_addr,
            writable: false,
            cache: Mutex::new(HandleCache::Weak(HashMap::new())),
        })
    }

    pub(crate) fn write(db: Arc<DbCore>, root_addr: u64) -> Arc<ViewCore> {
        Arc::new(ViewCore {
            db,
            root_addr,
            writable: true,
            cache: Mutex::new(HandleCache::Strong(HashMap::new())),
        })
    }

    pub(crate) fn root(view: &Arc<ViewCore>) -> Node {
        ViewCore::handle(view, view.root_addr)
    }

    /// Mint or revive the handle for `addr`.
    pub(crate) fn handle(view: &Arc<ViewCore>, addr: u64) -> Node {
        let mut cache = lock(&view.cache);
        match &mut *cache {
            HandleCache::Weak(map) => {
                if let Some(inner) = map.get(&addr).and_then(Weak::upgrade) {
                    return Node { inner };
                }
                let inner = Arc::new(NodeInner::attached(view.clone(), addr));
                map.insert(addr, Arc::downgrade(&inner));
                Node { inner }
            }
            HandleCache::Strong(map) => {
                if let Some(inner) = map.get(&addr) {
                    return Node {
                        inner: inner.clone(),
                    };
                }
                let inner = Arc::new(NodeInner::attached(view.clone(), addr));
                map.insert(addr, inner.clone());
                Node { inner }
            }
        }
    }

    /// Drop every cached handle. The write view does this when its
    /// transaction ends, which also breaks the handle-to-view reference
    /// cycle the strong cache creates.
    pub(crate) fn clear_cache(&self) {
        match &mut *lock(&self.cache) {
            HandleCache::Weak(map) => map.clear(),
            HandleCache::Strong(map) => map.clear(),
        }
    }
}

/// A mapping-like accessor bound to one record of one view, or to a
/// detached in-memory mapping that has not been written yet.
///
/// Cloning a `Node` clones the handle; both clones observe and apply the
/// same mutations. Handles obtained from a read view reject mutation.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    origin: Option<Origin>,
    /// `None` until materialized.
    state: Mutex<Option<BTreeMap<String, Value>>>,
}

struct Origin {
    view: Arc<ViewCore>,
    addr: u64,
}

impl NodeInner {
    fn attached(view: Arc<ViewCore>, addr: u64) -> NodeInner {
        NodeInner {
            origin: Some(Origin { view, addr }),
            state: Mutex::new(None),
        }
    }
}

impl Node {
    /// A detached, empty in-memory mapping not yet bound to any database.
    /// Assigning it into a transaction writes it out on commit.
    pub fn detached() -> Node {
        Node::from_entries(BTreeMap::new())
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, Value>) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                origin: None,
                state: Mutex::new(Some(entries)),
            }),
        }
    }

    /// The record address this handle was born at; `None` for detached
    /// nodes. Preserved across mutations, so it names the last committed
    /// record for this subtree, not necessarily its current contents.
    pub fn addr(&self) -> Option<u64> {
        self.inner.origin.as_ref().map(|origin| origin.addr)
    }

    /// The address of this handle if it is attached to `db`.
    pub(crate) fn addr_in(&self, db: &Arc<DbCore>) -> Option<u64> {
        self.inner
            .origin
            .as_ref()
            .filter(|origin| Arc::ptr_eq(&origin.view.db, db))
            .map(|origin| origin.addr)
    }

    pub(crate) fn is_materialized(&self) -> bool {
        lock(&self.inner.state).is_some()
    }

    fn check_writable(&self) -> Result<()> {
        match self.inner.origin.as_ref() {
            Some(origin) if !origin.view.writable => Err(Error::ReadOnlyView),
            _ => Ok(()),
        }
    }

    /// Run `f` over the entry map, reading and resolving the record on
    /// first access.
    fn with_state<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Value>) -> R) -> Result<R> {
        let mut guard = lock(&self.inner.state);
        if let Some(entries) = guard.as_mut() {
            return Ok(f(entries));
        }

        // Unmaterialized implies attached: detached nodes are born with
        // their state in place.
        let mut entries = BTreeMap::new();
        if let Some(origin) = self.inner.origin.as_ref() {
            let bytes = origin.view.db.store.read_record(origin.addr)?;
            let payload = codec::decode_record(&bytes, origin.addr)?;
            let object = payload.as_object().ok_or_else(|| Error::CorruptRecord {
                addr: origin.addr,
                reason: "record is not a mapping".to_string(),
            })?;
            for (key, slot) in object {
                entries.insert(key.clone(), codec::decode_slot(slot, &origin.view, origin.addr)?);
            }
        }
        let result = f(&mut entries);
        *guard = Some(entries);
        Ok(result)
    }

    /// Look up `key`, returning a clone of the slot. Mapping slots clone
    /// as shared handles; sequence and scalar slots clone by value.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.with_state(|entries| entries.get(key).cloned())
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.check_writable()?;
        let key = key.into();
        let value = value.into();
        self.with_state(|entries| {
            entries.insert(key, value);
        })
    }

    /// Remove an entry, returning the previous slot if there was one.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.check_writable()?;
        self.with_state(|entries| entries.remove(key))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.with_state(|entries| entries.contains_key(key))
    }

    pub fn len(&self) -> Result<usize> {
        self.with_state(|entries| entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_state(|entries| entries.is_empty())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.with_state(|entries| entries.keys().cloned().collect())
    }

    /// All entries, cloned out in key order.
    pub fn entries(&self) -> Result<Vec<(String, Value)>> {
        self.with_state(|entries| {
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    /// Deep-copy this mapping into plain JSON, materializing every
    /// subtree it reaches. The result is fully detached.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let mut object = serde_json::Map::new();
        for (key, value) in self.entries()? {
            object.insert(key, value.to_json()?);
        }
        Ok(serde_json::Value::Object(object))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
