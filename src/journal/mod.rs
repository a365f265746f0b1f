//! The journal: a newline-delimited shadow of the database that git can
//! diff and merge.

pub mod codec;
pub mod export;
pub mod import;
pub mod lock;

pub use codec::{decode_journal, encode_line, supersedes, CodecError, SCHEMA_VERSION};
pub use export::{export, render, ExportError, ExportOutcome};
pub use import::{import, import_file, ImportError, ImportReport};
pub use lock::{SyncLock, SyncLockError};
