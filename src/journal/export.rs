//! Deterministic projection of the store into the journal file.

use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;

use super::codec::encode_line;
use super::lock::{SyncLock, SyncLockError};
use crate::paths::BeadsPaths;
use crate::store::{ListFilter, StoreBackend, StoreError};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] SyncLockError),
    #[error("journal write failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOutcome {
    /// False when the journal already matched and the rename was skipped.
    pub written: bool,
    pub records: usize,
}

/// Render every issue (including closed ones: deletion is soft and the
/// record must stay mergeable) sorted by id, write to a sibling temp
/// file, and rename atomically. Identical bytes skip the rename so file
/// watchers see no spurious event.
pub fn export(store: &dyn StoreBackend, paths: &BeadsPaths) -> Result<ExportOutcome, ExportError> {
    let _lock = SyncLock::acquire(&paths.sync_lock())?;
    export_locked(store, paths)
}

/// The full journal content for the store's current state. Pure
/// projection; `doctor` uses it to check determinism and drift.
pub fn render(store: &dyn StoreBackend) -> Result<String, StoreError> {
    let mut issues = store.list(&ListFilter::default())?;
    issues.sort_by(|a, b| a.id.cmp(&b.id));

    let mut content = String::new();
    for issue in &issues {
        content.push_str(&encode_line(issue));
        content.push('\n');
    }
    Ok(content)
}

/// Export body for callers that already hold the journal lock.
pub(crate) fn export_locked(
    store: &dyn StoreBackend,
    paths: &BeadsPaths,
) -> Result<ExportOutcome, ExportError> {
    let content = render(store)?;
    let records = content.lines().count();

    let journal = paths.journal();
    let io_err = |source| ExportError::Io {
        path: journal.clone(),
        source,
    };

    if let Ok(existing) = std::fs::read_to_string(&journal) {
        if existing == content {
            return Ok(ExportOutcome {
                written: false,
                records,
            });
        }
    }

    let dir = journal.parent().expect("journal lives inside .beads");
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(content.as_bytes()).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(&journal).map_err(|e| io_err(e.error))?;

    tracing::debug!(records, path = ?journal, "journal exported");
    Ok(ExportOutcome {
        written: true,
        records,
    })
}
