//! Append-only record file with a fixed textual header.
//!
//! File layout:
//! - Header (9 bytes total):
//!   - ROOT      [0..8)  = address of the current root record, 8 lowercase
//!     zero-padded hex digits
//!   - NEWLINE   [8..9)  = b'\n'
//! - Records (variable length), each:
//!   - PAYLOAD   = one JSON value, no interior newlines
//!   - NEWLINE   = b'\n'
//!
//! An address is the byte offset of the first payload byte of a record.
//! Records are appended and never rewritten; the header is the only region
//! of the file that is ever overwritten. A fresh file holds the empty root
//! mapping `{}` at offset 9, so the smallest valid file is 12 bytes.
//!
//! Durability: appends are not individually synced. Publishing a new root
//! first syncs the appended data, then overwrites the header, then flushes
//! and syncs again, so after a crash the header names either the old root
//! or the new one, and every record reachable from it is on disk. Bytes
//! appended by an abandoned transaction are unreachable and benign.
//!
//! Concurrency: all file access is serialized by an internal mutex. Each
//! operation acquires it once; nothing here nests.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::data::lock;
use crate::error::{Error, Result};

/// Total header length in bytes.
pub(crate) const HEADER_LEN: u64 = 9;
/// Width of the root address field in hex digits.
const ROOT_DIGITS: usize = 8;
/// Contents of a freshly initialized file: header plus empty root mapping.
const EMPTY_FILE: &[u8] = b"00000009\n{}\n";

/// The single backing file of a database: header maintenance, record
/// appends and reads, and the root publish fence.
pub(crate) struct Store {
    path: PathBuf,
    state: Mutex<StoreState>,
}

struct StoreState {
    /// `None` once the store has been closed.
    file: Option<File>,
    /// In-memory copy of the header's root address.
    root_addr: u64,
}

impl StoreState {
    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(Error::Closed)
    }
}

impl Store {
    /// Open or create the backing file at `path`.
    ///
    /// An empty or absent file is initialized to the 12-byte empty
    /// database. An existing file has its header parsed and bounds-checked
    /// against the file length.
    pub(crate) fn open(path: &Path) -> Result<Store> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let root_addr = if len == 0 {
            file.write_all(EMPTY_FILE)?;
            file.flush()?;
            HEADER_LEN
        } else {
            read_root(&mut file, len)?
        };

        Ok(Store {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState {
                file: Some(file),
                root_addr,
            }),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The currently published root address.
    pub(crate) fn root_addr(&self) -> Result<u64> {
        let mut state = lock(&self.state);
        state.file()?;
        Ok(state.root_addr)
    }

    /// Current file size in bytes.
    pub(crate) fn size(&self) -> Result<u64> {
        let mut state = lock(&self.state);
        Ok(state.file()?.metadata()?.len())
    }

    /// Read the record payload starting at `addr`, without its trailing
    /// newline.
    pub(crate) fn read_record(&self, addr: u64) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        let file = state.file()?;

        let len = file.metadata()?.len();
        if addr < HEADER_LEN || addr >= len {
            return Err(Error::BadAddress { addr });
        }

        file.seek(SeekFrom::Start(addr))?;
        let mut payload = Vec::new();
        BufReader::new(file).read_until(b'\n', &mut payload)?;
        if payload.last() == Some(&b'\n') {
            payload.pop();
        }
        if payload.is_empty() {
            return Err(Error::CorruptRecord {
                addr,
                reason: "empty record".to_string(),
            });
        }
        Ok(payload)
    }

    /// Append one record payload and return its address. The payload must
    /// not contain a newline. The write is not synced here; durability is
    /// bound to [`Store::publish_root`].
    pub(crate) fn append_record(&self, payload: &[u8]) -> Result<u64> {
        let mut state = lock(&self.state);
        let file = state.file()?;

        let addr = file.seek(SeekFrom::End(0))?;
        file.write_all(payload)?;
        file.write_all(b"\n")?;
        Ok(addr)
    }

    /// Publish `addr` as the new root: sync the appended region, overwrite
    /// the header, then flush and sync again.
    pub(crate) fn publish_root(&self, addr: u64) -> Result<()> {
        if addr > u64::from(u32::MAX) {
            return Err(Error::AddressOverflow { addr });
        }

        let mut state = lock(&self.state);
        let file = state.file()?;

        // Appended records must be durable before the header names them.
        file.sync_data()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(format!("{addr:08x}").as_bytes())?;
        file.flush()?;
        file.sync_data()?;

        state.root_addr = addr;
        Ok(())
    }

    /// Flush and sync the file.
    pub(crate) fn sync(&self) -> Result<()> {
        let mut state = lock(&self.state);
        let file = state.file()?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Close the backing file. Idempotent; later operations fail with
    /// [`Error::Closed`].
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.file = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).file.is_none()
    }
}

/// Parse and validate the header of a non-empty file.
fn read_root(file: &mut File, file_len: u64) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|_| Error::CorruptHeader {
        reason: "file is shorter than the header".to_string(),
    })?;

    if header[ROOT_DIGITS] != b'\n' {
        return Err(Error::CorruptHeader {
            reason: "missing newline after root address".to_string(),
        });
    }
    let digits =
        std::str::from_utf8(&header[..ROOT_DIGITS]).map_err(|_| Error::CorruptHeader {
            reason: "root address is not ASCII".to_string(),
        })?;
    let root = u64::from_str_radix(digits, 16).map_err(|_| Error::CorruptHeader {
        reason: format!("root address {digits:?} is not hexadecimal"),
    })?;

    if root < HEADER_LEN || root >= file_len {
        return Err(Error::CorruptHeader {
            reason: format!("root address {root:#x} is outside the record region"),
        });
    }
    Ok(root)
}
