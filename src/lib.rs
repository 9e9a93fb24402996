//! An embedded, single-file, persistent hierarchical key-value store
//! with copy-on-write commits and structural sharing.
//!
//! A database is a rooted tree of mappings, sequences and scalars, stored
//! in one append-only file: a 9-byte header naming the root record,
//! followed by newline-terminated JSON records, one per mapping. Readers
//! take immutable lazy snapshots and may hold them indefinitely; a single
//! writer mutates handles inside a transaction, and commit appends only
//! the records for subtrees that actually changed before atomically
//! publishing the new root.
//!
//! ```
//! use kodama::{Database, Value};
//! use serde_json::json;
//!
//! let dir = tempfile::tempdir()?;
//! let db = Database::open(dir.path().join("app.db"))?;
//!
//! db.transaction(|root| {
//!     root.set("people", Value::from_json(&json!(["Jim", "Phil"])))?;
//!     root.set("score", Value::from_json(&json!({"top": 8})))
//! })?;
//!
//! assert_eq!(
//!     db.view()?.to_json()?,
//!     json!({"people": ["Jim", "Phil"], "score": {"top": 8}})
//! );
//! # Ok::<(), kodama::Error>(())
//! ```

mod data;
pub mod error;
pub mod value;

pub use data::Database;
pub use data::tree::Node;
pub use error::{Error, Result};
pub use value::Value;
