//! Database lifecycle: open, snapshot views, write transactions,
//! compaction.
//!
//! Concurrency discipline: one write transaction at a time, any number of
//! concurrent readers. The transaction gate is held for the whole
//! transaction including the publish fence, and also for compaction. A
//! view captured before a commit keeps observing its root address for as
//! long as it lives; the file is append-only, so those records never
//! move.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use log::debug;

use crate::data::diff::DiffWriter;
use crate::data::tree::{Node, ViewCore};
use crate::data::write::Store;
use crate::error::{Error, Result};

pub(crate) mod codec;
pub(crate) mod diff;
pub(crate) mod tree;
pub(crate) mod write;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every view and handle of one open database.
pub(crate) struct DbCore {
    pub(crate) store: Store,
    txn: TxnState,
}

struct TxnState {
    /// Serializes writers. Held for the whole transaction, including the
    /// publish fence, and for compaction.
    gate: Mutex<()>,
    /// Thread currently inside a transaction, for nested-begin detection.
    owner: Mutex<Option<ThreadId>>,
}

impl DbCore {
    /// Diff `new_root` against the committed tree and publish the result.
    /// Returns whether anything changed. Caller holds the gate.
    fn publish_changes(core: &Arc<DbCore>, new_root: &Node) -> Result<bool> {
        let base = core.store.root_addr()?;
        let old_root = ViewCore::root(&ViewCore::read(core.clone(), base));
        match DiffWriter::write_changes(core, &old_root, new_root)? {
            Some(addr) => {
                core.store.publish_root(addr)?;
                debug!(
                    "published root {addr:#x} in {}",
                    core.store.path().display()
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Clears the transaction owner when the transaction scope ends, on both
/// the commit and the unwind path.
struct TxnTicket<'a> {
    core: &'a DbCore,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for TxnTicket<'_> {
    fn drop(&mut self) {
        *lock(&self.core.txn.owner) = None;
    }
}

/// Empties the write view's strong cache when the transaction scope ends.
/// Cached handles hold the view and the view holds them; dropping the
/// cache lets both go once the caller releases its handles.
struct CacheGuard<'a>(&'a ViewCore);

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.0.clear_cache();
    }
}

/// An embedded database backed by a single append-only file.
pub struct Database {
    core: Arc<DbCore>,
}

impl Database {
    /// Open the database at `path`, creating an empty one if the file
    /// does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        let store = Store::open(path.as_ref())?;
        debug!(
            "opened {} root={:#x}",
            store.path().display(),
            store.root_addr()?
        );
        Ok(Database {
            core: Arc::new(DbCore {
                store,
                txn: TxnState {
                    gate: Mutex::new(()),
                    owner: Mutex::new(None),
                },
            }),
        })
    }

    /// An immutable snapshot rooted at the current root. Safe to navigate
    /// while a writer is active; it keeps reporting the same tree even
    /// after later commits.
    pub fn view(&self) -> Result<Node> {
        let root_addr = self.core.store.root_addr()?;
        Ok(ViewCore::root(&ViewCore::read(self.core.clone(), root_addr)))
    }

    /// Run `body` as a write transaction over the current root.
    ///
    /// The mutable root handle is only valid inside `body`. When `body`
    /// returns `Ok`, changed subtrees are appended and the new root is
    /// published atomically; when it returns `Err`, nothing is published
    /// and the error propagates.
    ///
    /// One transaction may be in flight per database. A second writer
    /// blocks; a nested call on the same thread fails with
    /// [`Error::NestedTransaction`].
    pub fn transaction<T>(&self, body: impl FnOnce(&Node) -> Result<T>) -> Result<T> {
        let _ticket = self.begin()?;
        let root_addr = self.core.store.root_addr()?;

        let view = ViewCore::write(self.core.clone(), root_addr);
        let _cache = CacheGuard(&view);
        let root = ViewCore::root(&view);

        let result = body(&root)?;
        DbCore::publish_changes(&self.core, &root)?;
        Ok(result)
    }

    fn begin(&self) -> Result<TxnTicket<'_>> {
        let me = thread::current().id();
        if *lock(&self.core.txn.owner) == Some(me) {
            return Err(Error::NestedTransaction);
        }
        let gate = lock(&self.core.txn.gate);
        *lock(&self.core.txn.owner) = Some(me);
        Ok(TxnTicket {
            core: &self.core,
            _gate: gate,
        })
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.core.store.size()
    }

    /// Flush and fsync the backing file.
    pub fn sync(&self) -> Result<()> {
        self.core.store.sync()
    }

    /// Rebuild the file so it contains only the records reachable from
    /// the live root, then swap it in place. Returns a handle to the
    /// reopened database; this handle is closed, and views taken over it
    /// no longer resolve.
    pub fn compact(&self) -> Result<Database> {
        let _ticket = self.begin()?;

        let root_addr = self.core.store.root_addr()?;
        let live_root = ViewCore::root(&ViewCore::read(self.core.clone(), root_addr));
        let path = self.core.store.path().to_path_buf();

        let mut scratch = path.clone().into_os_string();
        scratch.push(".compacting");
        let scratch = PathBuf::from(scratch);
        if scratch.exists() {
            // Leftover from an interrupted compaction. It was never
            // renamed over the live file, so it holds nothing we need.
            fs::remove_file(&scratch)?;
        }

        let fresh = Database::open(&scratch)?;
        DbCore::publish_changes(&fresh.core, &live_root)?;
        fresh.core.store.close();
        self.core.store.close();

        fs::remove_file(&path)?;
        fs::rename(&scratch, &path)?;
        debug!("compacted {}", path.display());
        Database::open(&path)
    }

    /// Close the backing file. Idempotent; every later operation on this
    /// handle or its views fails with [`Error::Closed`].
    pub fn close(&self) {
        self.core.store.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.store.is_closed()
    }

    /// Close the database and delete its backing file.
    pub fn destroy(self) -> Result<()> {
        let path = self.core.store.path().to_path_buf();
        self.core.store.close();
        fs::remove_file(&path)?;
        debug!("destroyed {}", path.display());
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.core.store.path())
            .field("closed", &self.core.store.is_closed())
            .finish()
    }
}
