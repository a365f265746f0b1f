//! Journal-to-store merge.
//!
//! Each record is compared against the store's copy and applied
//! last-writer-wins on `updated_at`. Stale records are ignored but
//! reported. The whole merge is one store transaction: either every
//! applicable record lands or none do.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::codec::{decode_journal, CodecError};
use super::lock::{SyncLock, SyncLockError};
use crate::core::IssueId;
use crate::paths::BeadsPaths;
use crate::store::{BatchOutcome, StoreBackend, StoreError};

#[derive(Debug, Error)]
pub enum ImportError {
    /// Schema mismatch aborts; malformed lines do not reach this error.
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] SyncLockError),
    #[error("journal read failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-import accounting, also the `--json` payload of `bd import`.
#[derive(Debug, Default, serde::Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    /// Records older than the store's copy, ignored but counted.
    pub ignored_stale: usize,
    pub malformed: Vec<String>,
    /// Edges whose target id is unknown after the deferred retry pass.
    pub dangling: Vec<DanglingRef>,
    /// Blocks edges rejected because applying them would form a cycle.
    pub cycles: Vec<CycleRef>,
}

#[derive(Debug, serde::Serialize)]
pub struct DanglingRef {
    pub from: IssueId,
    pub to: IssueId,
}

#[derive(Debug, serde::Serialize)]
pub struct CycleRef {
    pub from: IssueId,
    pub to: IssueId,
}

impl ImportReport {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Merge the database's own journal into the store.
pub fn import(store: &dyn StoreBackend, paths: &BeadsPaths) -> Result<ImportReport, ImportError> {
    let _lock = SyncLock::acquire(&paths.sync_lock())?;
    import_file_locked(store, &paths.journal())
}

/// Merge an arbitrary journal file (the `bd import <file>` path).
pub fn import_file(
    store: &dyn StoreBackend,
    paths: &BeadsPaths,
    file: &Path,
) -> Result<ImportReport, ImportError> {
    let _lock = SyncLock::acquire(&paths.sync_lock())?;
    import_file_locked(store, file)
}

pub(crate) fn import_file_locked(
    store: &dyn StoreBackend,
    file: &Path,
) -> Result<ImportReport, ImportError> {
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        // A journal that does not exist yet is an empty journal.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ImportError::Io {
                path: file.to_path_buf(),
                source,
            })
        }
    };

    let decoded = decode_journal(&content)?;
    let BatchOutcome {
        inserted,
        updated,
        ignored_stale,
        dangling,
        cycles,
    } = store.import_batch(decoded.issues)?;

    let report = ImportReport {
        inserted,
        updated,
        ignored_stale,
        malformed: decoded.malformed.iter().map(|e| e.to_string()).collect(),
        dangling: dangling
            .into_iter()
            .map(|(from, to)| DanglingRef { from, to })
            .collect(),
        cycles: cycles
            .into_iter()
            .map(|(from, to)| CycleRef { from, to })
            .collect(),
    };

    for warning in &report.malformed {
        tracing::warn!("{warning}");
    }
    for DanglingRef { from, to } in &report.dangling {
        tracing::warn!(%from, %to, "dangling reference dropped during import");
    }
    for CycleRef { from, to } in &report.cycles {
        tracing::warn!(%from, %to, "cycle-forming blocks edge rejected during import");
    }

    Ok(report)
}
