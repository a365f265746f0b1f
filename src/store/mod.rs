//! Issue storage.
//!
//! `StoreBackend` is the capability seam between the sync core and the
//! concrete embedded store: the exporter, importer, and supervisor only
//! see {read, write, subscribe}. `SqliteStore` is the one backend today.

mod schema;
mod sqlite;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::{DepKind, Issue, IssueId, IssueType, Priority, Status, Timestamp};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("issue not found: {id}")]
    NotFound { id: IssueId },
    #[error("issue {id} was modified concurrently (expected updated_at {expected}, found {found})")]
    Conflict {
        id: IssueId,
        expected: Timestamp,
        found: Timestamp,
    },
    #[error("dependency {from} blocks {to} would create a cycle")]
    CycleDetected { from: IssueId, to: IssueId },
    #[error("dependency already exists: {from} {kind} {to}")]
    DepExists {
        from: IssueId,
        to: IssueId,
        kind: DepKind,
    },
    #[error("dependency not found: {from} {kind} {to}")]
    DepNotFound {
        from: IssueId,
        to: IssueId,
        kind: DepKind,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store invariant violated: {0}")]
    Internal(String),
}

/// Emitted to subscribers after each committed mutation.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Created(IssueId),
    Updated(IssueId),
    Closed(IssueId),
    Reopened(IssueId),
    DepAdded {
        from: IssueId,
        to: IssueId,
        kind: DepKind,
    },
    DepRemoved {
        from: IssueId,
        to: IssueId,
        kind: DepKind,
    },
    /// One batch import; `changed` counts inserted + updated records.
    Imported { changed: usize },
}

pub type Listener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Fields for `create`.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub design: String,
    pub acceptance_criteria: String,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub external_ref: Option<String>,
    pub deps: Vec<(IssueId, DepKind)>,
}

/// Partial update. `None` leaves a field untouched. `expected_updated_at`
/// enables optimistic locking: a mismatch fails with `Conflict`.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub issue_type: Option<IssueType>,
    pub external_ref: Option<Option<String>>,
    pub expected_updated_at: Option<Timestamp>,
}

impl IssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.external_ref.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub issue_type: Option<IssueType>,
    pub priority: Option<Priority>,
    pub limit: Option<usize>,
}

/// Result of one transactional journal merge.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub ignored_stale: usize,
    /// (from, to) edges dropped because the target id is unknown after
    /// the deferred retry pass.
    pub dangling: Vec<(IssueId, IssueId)>,
    /// (from, to) blocks edges rejected because inserting them would
    /// close a cycle in the blocks subgraph.
    pub cycles: Vec<(IssueId, IssueId)>,
}

/// Counts for `bd stats`.
#[derive(Debug, Default, serde::Serialize)]
pub struct Stats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub closed: usize,
    pub ready: usize,
}

/// Capability interface over the embedded store.
pub trait StoreBackend: Send + Sync {
    // Reads: all observe a consistent snapshot.
    fn show(&self, id: &IssueId) -> Result<Issue, StoreError>;
    fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>, StoreError>;
    /// Open issues whose `blocks` dependencies are all closed, sorted by
    /// (priority, created_at).
    fn ready(&self) -> Result<Vec<Issue>, StoreError>;
    fn stats(&self) -> Result<Stats, StoreError>;

    // Writes: atomic, linearizable within one store.
    fn create(&self, new: NewIssue) -> Result<Issue, StoreError>;
    fn update(&self, id: &IssueId, patch: IssuePatch) -> Result<Issue, StoreError>;
    fn close(&self, id: &IssueId, reason: Option<String>) -> Result<Issue, StoreError>;
    fn reopen(&self, id: &IssueId) -> Result<Issue, StoreError>;
    fn add_dep(&self, from: &IssueId, to: &IssueId, kind: DepKind) -> Result<(), StoreError>;
    fn remove_dep(&self, from: &IssueId, to: &IssueId, kind: DepKind) -> Result<(), StoreError>;
    /// Transactional last-writer-wins merge of collapsed journal records.
    fn import_batch(&self, incoming: Vec<Issue>) -> Result<BatchOutcome, StoreError>;

    // Config.
    fn config_all(&self) -> Result<BTreeMap<String, String>, StoreError>;
    fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Register a listener notified after every committed mutation.
    fn subscribe(&self, listener: Listener);
}
