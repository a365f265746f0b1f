//! Crate-level error: a thin wrapper over the subsystem errors, plus the
//! process-facing mappings (exit code, machine-readable code string,
//! transience classification).

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{InvalidIssueId, ParseDomainError};
use crate::daemon::{DaemonError, DaemonLockError, HookError};
use crate::git::GitError;
use crate::journal::{CodecError, ExportError, ImportError, SyncLockError};
use crate::store::StoreError;

/// Exit codes promised to scripts and hooks.
pub mod exit {
    pub const OK: i32 = 0;
    pub const USER: i32 = 1;
    pub const CONFLICT_NEEDS_HUMAN: i32 = 2;
    pub const LOCK_CONTENTION: i32 = 3;
    pub const GIT_FAILED: i32 = 4;
    pub const INTERNAL: i32 = 5;
}

/// Whether retrying the failed operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    Permanent,
    Retryable,
    Unknown,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Hooks(#[from] HookError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    InvalidId(#[from] InvalidIssueId),
    #[error(transparent)]
    Domain(#[from] ParseDomainError),
    #[error("{0}")]
    Usage(String),
}

impl Error {
    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    /// Stable machine-readable code, emitted next to the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Store(StoreError::NotFound { .. }) => "not_found",
            Error::Store(StoreError::Conflict { .. }) => "conflict",
            Error::Store(StoreError::CycleDetected { .. }) => "cycle_detected",
            Error::Store(StoreError::DepExists { .. }) => "dep_exists",
            Error::Store(StoreError::DepNotFound { .. }) => "dep_not_found",
            Error::Store(StoreError::Internal(_)) => "internal",
            Error::Store(_) => "store_error",
            Error::Export(ExportError::Lock(_)) | Error::Import(ImportError::Lock(_)) => {
                "lock_held"
            }
            Error::Import(ImportError::Codec(CodecError::SchemaMismatch { .. })) => {
                "schema_mismatch"
            }
            Error::Import(ImportError::Codec(_)) => "malformed_record",
            Error::Export(_) => "export_failed",
            Error::Import(_) => "import_failed",
            Error::Git(GitError::Timeout { .. }) => "git_timeout",
            Error::Git(GitError::ConflictNeedsHuman { .. }) => "conflict_needs_human",
            Error::Git(GitError::PushFailed { .. }) => "git_push_failed",
            Error::Git(_) => "git_failed",
            Error::Daemon(DaemonError::Lock(DaemonLockError::Held { .. })) => "lock_held",
            Error::Daemon(DaemonError::RepeatedInternal { .. }) => "internal",
            Error::Daemon(_) => "daemon_error",
            Error::Hooks(_) => "hooks_failed",
            Error::Config(_) => "invalid_config",
            Error::InvalidId(_) => "invalid_id",
            Error::Domain(_) => "invalid_argument",
            Error::Usage(_) => "usage",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Store(StoreError::Internal(_)) => exit::INTERNAL,
            Error::Store(StoreError::Sqlite(_)) => exit::INTERNAL,
            Error::Store(_) => exit::USER,
            Error::Export(ExportError::Lock(_)) | Error::Import(ImportError::Lock(_)) => {
                exit::LOCK_CONTENTION
            }
            Error::Export(_) | Error::Import(_) => exit::USER,
            Error::Git(GitError::ConflictNeedsHuman { .. }) => exit::CONFLICT_NEEDS_HUMAN,
            Error::Git(_) => exit::GIT_FAILED,
            Error::Daemon(DaemonError::Lock(DaemonLockError::Held { .. })) => {
                exit::LOCK_CONTENTION
            }
            Error::Daemon(DaemonError::Git(GitError::ConflictNeedsHuman { .. })) => {
                exit::CONFLICT_NEEDS_HUMAN
            }
            Error::Daemon(DaemonError::Git(_)) => exit::GIT_FAILED,
            Error::Daemon(DaemonError::RepeatedInternal { .. }) => exit::INTERNAL,
            Error::Daemon(_) => exit::USER,
            Error::Hooks(_) | Error::Config(_) | Error::InvalidId(_) | Error::Domain(_) => {
                exit::USER
            }
            Error::Usage(_) => exit::USER,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Error::Git(err) if err.is_retryable() => Transience::Retryable,
            Error::Export(ExportError::Lock(SyncLockError::Contended { .. }))
            | Error::Import(ImportError::Lock(SyncLockError::Contended { .. })) => {
                Transience::Retryable
            }
            Error::Daemon(DaemonError::Lock(DaemonLockError::Held { .. })) => {
                Transience::Retryable
            }
            Error::Store(StoreError::Internal(_)) => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
