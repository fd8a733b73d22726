//! Handle state table: per-open-handle role, running digest, and
//! read-verification cache, plus the path -> handles multimap.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Mutex;

use crate::digest::Fnv1a;

/// Role a handle plays.
#[derive(Debug)]
pub enum Role {
    Reader { verification: Verification },
    WriterFresh { acc: Fnv1a },
    WriterAppend { acc: Fnv1a },
    /// Block-checksum-mode handle: verification happens lazily
    /// per touched block on every read and write, so no whole-file
    /// accumulator or cached verdict is carried here.
    Block { is_writer: bool },
}

/// Per-handle verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Unverified,
    Ok,
    Bad,
}

/// State tracked for one open handle.
pub struct HandleRecord {
    pub path: String,
    pub file: File,
    pub role: Role,
}

struct Inner {
    next_fh: u64,
    handles: HashMap<u64, HandleRecord>,
    by_path: HashMap<String, HashSet<u64>>,
}

/// Process-wide (per-mount) table of open handles, guarded by a single
/// lock released before any host filesystem I/O.
pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { next_fh: 1, handles: HashMap::new(), by_path: HashMap::new() }) }
    }

    /// Mint a new handle and register it under `path`.
    pub fn insert(&self, path: String, file: File, role: Role) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let fh = inner.next_fh;
        inner.next_fh += 1;
        inner.by_path.entry(path.clone()).or_default().insert(fh);
        inner.handles.insert(fh, HandleRecord { path, file, role });
        fh
    }

    /// True if a writer handle is already open on `path`.
    pub fn has_writer(&self, path: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(fhs) = inner.by_path.get(path) else { return false };
        fhs.iter().any(|fh| {
            matches!(
                inner.handles.get(fh),
                Some(r) if matches!(r.role, Role::WriterFresh { .. } | Role::WriterAppend { .. } | Role::Block { is_writer: true })
            )
        })
    }

    /// Remove and return the handle, along with the path it was opened on.
    pub fn remove(&self, fh: u64) -> Option<HandleRecord> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.handles.remove(&fh)?;
        if let Some(set) = inner.by_path.get_mut(&record.path) {
            set.remove(&fh);
            if set.is_empty() {
                inner.by_path.remove(&record.path);
            }
        }
        Some(record)
    }

    /// Run `f` with mutable access to the handle record, if it exists.
    pub fn with_mut<R>(&self, fh: u64, f: impl FnOnce(&mut HandleRecord) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.handles.get_mut(&fh).map(f)
    }

    /// Reset the accumulator of every open writer handle on `path` to
    /// `new_digest`, used after an external truncate.
    pub fn reset_writer_accumulators(&self, path: &str, new_digest: Fnv1a) {
        let mut inner = self.inner.lock().unwrap();
        let Some(fhs) = inner.by_path.get(path).cloned() else { return };
        for fh in fhs {
            if let Some(record) = inner.handles.get_mut(&fh) {
                match &mut record.role {
                    Role::WriterFresh { acc } | Role::WriterAppend { acc } => *acc = new_digest,
                    Role::Reader { .. } | Role::Block { .. } => {}
                }
            }
        }
    }
}
