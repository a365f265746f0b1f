//! The embedded relational store.
//!
//! One `rusqlite::Connection` behind a mutex; every write runs in a
//! transaction and listeners are notified only after commit, with the
//! connection lock released. Reads build full `Issue` values (row +
//! dependency edges) so callers always see a consistent snapshot.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::schema;
use super::{
    BatchOutcome, ChangeEvent, IssuePatch, ListFilter, Listener, NewIssue, Stats, StoreBackend,
    StoreError,
};
use crate::config::{Config, KEY_ISSUE_PREFIX};
use crate::core::{DepEdge, DepKind, Issue, IssueId, IssueType, Priority, Status, Timestamp};
use crate::journal::supersedes;

const ID_RETRY_LIMIT: usize = 8;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    listeners: Mutex<Vec<Listener>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open an existing database (creating the schema if the file is new).
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = schema::open(path)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            listeners: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        })
    }

    /// Initialize a fresh database with its issue prefix.
    pub fn init(path: &Path, prefix: &str) -> Result<Self, StoreError> {
        let store = Self::open(path)?;
        store.config_set(KEY_ISSUE_PREFIX, prefix)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Monotonic mutation counter. The daemon polls this to observe
    /// writes made by other processes (their in-process listeners cannot
    /// reach us); any advance is a cheap export trigger.
    pub fn history_seq(&self) -> Result<i64, StoreError> {
        let conn = self.lock_conn();
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM history",
            [],
            |row| row.get(0),
        )?)
    }

    /// Typed config snapshot.
    pub fn config(&self) -> Result<Config, StoreError> {
        Ok(Config::from_pairs(&self.config_all()?)?)
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, events: &[ChangeEvent]) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }
}

// Row <-> Issue mapping.

fn internal(context: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(format!("{context}: {detail}"))
}

fn issue_from_row(row: &rusqlite::Row<'_>) -> Result<Issue, rusqlite::Error> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let priority: i64 = row.get("priority")?;
    let issue_type: String = row.get("issue_type")?;
    let invalid = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };

    Ok(Issue {
        id: IssueId::parse(&id).map_err(|e| invalid(e.to_string()))?,
        title: row.get("title")?,
        description: row.get("description")?,
        design: row.get("design")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        status: status.parse().map_err(|e: crate::core::ParseDomainError| invalid(e.to_string()))?,
        priority: Priority::new(priority as u8).map_err(|e| invalid(e.to_string()))?,
        issue_type: issue_type
            .parse()
            .map_err(|e: crate::core::ParseDomainError| invalid(e.to_string()))?,
        created_at: Timestamp::from_millis(row.get("created_at")?),
        updated_at: Timestamp::from_millis(row.get("updated_at")?),
        closed_at: row
            .get::<_, Option<i64>>("closed_at")?
            .map(Timestamp::from_millis),
        close_reason: row.get("close_reason")?,
        external_ref: row.get("external_ref")?,
        deps: Vec::new(),
    })
}

const SELECT_ISSUE: &str = "SELECT id, title, description, design, acceptance_criteria, status, \
     priority, issue_type, created_at, updated_at, closed_at, close_reason, external_ref \
     FROM issues";

fn load_issue(tx: &Connection, id: &IssueId) -> Result<Option<Issue>, StoreError> {
    let issue = tx
        .query_row(
            &format!("{SELECT_ISSUE} WHERE id = ?1"),
            params![id.as_str()],
            issue_from_row,
        )
        .optional()?;
    let Some(mut issue) = issue else {
        return Ok(None);
    };
    issue.deps = load_deps(tx, id)?;
    Ok(Some(issue))
}

fn load_deps(tx: &Connection, id: &IssueId) -> Result<Vec<DepEdge>, StoreError> {
    let mut stmt = tx.prepare("SELECT to_id, kind FROM deps WHERE from_id = ?1")?;
    let mut deps = stmt
        .query_map(params![id.as_str()], |row| {
            let to: String = row.get(0)?;
            let kind: String = row.get(1)?;
            Ok((to, kind))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(to, kind)| {
            Ok(DepEdge {
                to: IssueId::parse(&to).map_err(|e| internal("dep target", e))?,
                kind: kind.parse().map_err(|e| internal("dep kind", e))?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    deps.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.to.cmp(&b.to)));
    Ok(deps)
}

fn require_issue(tx: &Connection, id: &IssueId) -> Result<Issue, StoreError> {
    load_issue(tx, id)?.ok_or_else(|| StoreError::NotFound { id: id.clone() })
}

fn write_issue_row(tx: &Transaction<'_>, issue: &Issue) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO issues (id, title, description, design, acceptance_criteria, status, \
         priority, issue_type, created_at, updated_at, closed_at, close_reason, external_ref) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
         ON CONFLICT(id) DO UPDATE SET \
           title = excluded.title, description = excluded.description, \
           design = excluded.design, acceptance_criteria = excluded.acceptance_criteria, \
           status = excluded.status, priority = excluded.priority, \
           issue_type = excluded.issue_type, created_at = excluded.created_at, \
           updated_at = excluded.updated_at, closed_at = excluded.closed_at, \
           close_reason = excluded.close_reason, external_ref = excluded.external_ref",
        params![
            issue.id.as_str(),
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.status.as_str(),
            issue.priority.value(),
            issue.issue_type.as_str(),
            issue.created_at.as_millis(),
            issue.updated_at.as_millis(),
            issue.closed_at.map(Timestamp::as_millis),
            issue.close_reason,
            issue.external_ref,
        ],
    )?;
    Ok(())
}

fn record_history(
    tx: &Transaction<'_>,
    op: &str,
    issue_id: Option<&IssueId>,
    detail: Option<&str>,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO history (at, op, issue_id, detail) VALUES (?1, ?2, ?3, ?4)",
        params![
            Timestamp::now().as_millis(),
            op,
            issue_id.map(IssueId::as_str),
            detail,
        ],
    )?;
    Ok(())
}

/// Next `updated_at` for a mutation: wall clock, but strictly after the
/// previous value so last-writer-wins stays monotonic per issue even
/// under clock skew.
fn next_updated_at(previous: Timestamp) -> Timestamp {
    let now = Timestamp::now();
    if now > previous {
        now
    } else {
        Timestamp::from_millis(previous.as_millis() + 1)
    }
}

/// Is `target` reachable from `start` following `blocks` edges?
fn blocks_reaches(
    tx: &Connection,
    start: &IssueId,
    target: &IssueId,
) -> Result<bool, StoreError> {
    let mut stmt =
        tx.prepare("SELECT to_id FROM deps WHERE from_id = ?1 AND kind = 'blocks'")?;
    let mut queue = VecDeque::from([start.clone()]);
    let mut seen: HashSet<IssueId> = HashSet::new();

    while let Some(current) = queue.pop_front() {
        if current == *target {
            return Ok(true);
        }
        if !seen.insert(current.clone()) {
            continue;
        }
        let nexts = stmt
            .query_map(params![current.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for next in nexts {
            queue.push_back(IssueId::parse(&next).map_err(|e| internal("dep target", e))?);
        }
    }
    Ok(false)
}

impl StoreBackend for SqliteStore {
    fn show(&self, id: &IssueId) -> Result<Issue, StoreError> {
        let conn = self.lock_conn();
        require_issue(&conn, id)
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Issue>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!("{SELECT_ISSUE} ORDER BY id"))?;
        let rows = stmt
            .query_map([], issue_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut issues = Vec::with_capacity(rows.len());
        for mut issue in rows {
            if let Some(status) = filter.status {
                if issue.status != status {
                    continue;
                }
            }
            if let Some(issue_type) = filter.issue_type {
                if issue.issue_type != issue_type {
                    continue;
                }
            }
            if let Some(priority) = filter.priority {
                if issue.priority != priority {
                    continue;
                }
            }
            issue.deps = load_deps(&conn, &issue.id)?;
            issues.push(issue);
            if filter.limit.is_some_and(|limit| issues.len() >= limit) {
                break;
            }
        }
        Ok(issues)
    }

    fn ready(&self) -> Result<Vec<Issue>, StoreError> {
        let open = self.list(&ListFilter {
            status: Some(Status::Open),
            ..Default::default()
        })?;
        let conn = self.lock_conn();

        let mut ready = Vec::new();
        for issue in open {
            let mut blocked = false;
            for dep in issue.blocking_deps() {
                let status: Option<String> = conn
                    .query_row(
                        "SELECT status FROM issues WHERE id = ?1",
                        params![dep.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                // An edge to an unknown id does not block; doctor reports it.
                if status.is_some_and(|s| s != Status::Closed.as_str()) {
                    blocked = true;
                    break;
                }
            }
            if !blocked {
                ready.push(issue);
            }
        }
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(ready)
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        let issues = self.list(&ListFilter::default())?;
        let ready = self.ready()?.len();
        let count = |status: Status| issues.iter().filter(|i| i.status == status).count();
        Ok(Stats {
            total: issues.len(),
            open: count(Status::Open),
            in_progress: count(Status::InProgress),
            blocked: count(Status::Blocked),
            closed: count(Status::Closed),
            ready,
        })
    }

    fn create(&self, new: NewIssue) -> Result<Issue, StoreError> {
        let prefix = self
            .config_all()?
            .get(KEY_ISSUE_PREFIX)
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_PREFIX.to_string());

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let created_at = Timestamp::now();
        let mut id = None;
        for _ in 0..ID_RETRY_LIMIT {
            let candidate = IssueId::generate(&prefix, created_at, &new.title);
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?1)",
                params![candidate.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or_else(|| internal("id generation", "exhausted collision retries"))?;

        let mut issue = Issue::new(
            id,
            new.title,
            new.priority.unwrap_or(Priority::DEFAULT),
            new.issue_type.unwrap_or(IssueType::Task),
        );
        issue.created_at = created_at;
        issue.updated_at = created_at;
        issue.description = new.description;
        issue.design = new.design;
        issue.acceptance_criteria = new.acceptance_criteria;
        issue.external_ref = new.external_ref;

        write_issue_row(&tx, &issue)?;
        for (to, kind) in &new.deps {
            require_issue(&tx, to)?;
            if *kind == DepKind::Blocks && blocks_reaches(&tx, to, &issue.id)? {
                return Err(StoreError::CycleDetected {
                    from: issue.id.clone(),
                    to: to.clone(),
                });
            }
            tx.execute(
                "INSERT INTO deps (from_id, to_id, kind) VALUES (?1, ?2, ?3)",
                params![issue.id.as_str(), to.as_str(), kind.as_str()],
            )?;
            issue.deps.push(DepEdge {
                to: to.clone(),
                kind: *kind,
            });
        }
        issue.sort_deps();

        record_history(&tx, "create", Some(&issue.id), None)?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::Created(issue.id.clone())]);
        Ok(issue)
    }

    fn update(&self, id: &IssueId, patch: IssuePatch) -> Result<Issue, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut issue = require_issue(&tx, id)?;
        if let Some(expected) = patch.expected_updated_at {
            if expected != issue.updated_at {
                return Err(StoreError::Conflict {
                    id: id.clone(),
                    expected,
                    found: issue.updated_at,
                });
            }
        }

        if let Some(title) = patch.title {
            issue.title = title;
        }
        if let Some(description) = patch.description {
            issue.description = description;
        }
        if let Some(design) = patch.design {
            issue.design = design;
        }
        if let Some(acceptance) = patch.acceptance_criteria {
            issue.acceptance_criteria = acceptance;
        }
        if let Some(status) = patch.status {
            issue.status = status;
            if status != Status::Closed {
                issue.closed_at = None;
                issue.close_reason = None;
            }
        }
        if let Some(priority) = patch.priority {
            issue.priority = priority;
        }
        if let Some(issue_type) = patch.issue_type {
            issue.issue_type = issue_type;
        }
        if let Some(external_ref) = patch.external_ref {
            issue.external_ref = external_ref;
        }
        issue.updated_at = next_updated_at(issue.updated_at);
        // A status patch to closed follows the same contract as close():
        // a closed issue always carries its closure timestamp.
        if issue.status == Status::Closed && issue.closed_at.is_none() {
            issue.closed_at = Some(issue.updated_at);
        }

        write_issue_row(&tx, &issue)?;
        record_history(&tx, "update", Some(id), None)?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::Updated(id.clone())]);
        Ok(issue)
    }

    fn close(&self, id: &IssueId, reason: Option<String>) -> Result<Issue, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut issue = require_issue(&tx, id)?;
        issue.status = Status::Closed;
        issue.updated_at = next_updated_at(issue.updated_at);
        issue.closed_at = Some(issue.updated_at);
        issue.close_reason = reason;

        write_issue_row(&tx, &issue)?;
        record_history(&tx, "close", Some(id), issue.close_reason.as_deref())?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::Closed(id.clone())]);
        Ok(issue)
    }

    fn reopen(&self, id: &IssueId) -> Result<Issue, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut issue = require_issue(&tx, id)?;
        issue.status = Status::Open;
        issue.closed_at = None;
        issue.close_reason = None;
        issue.updated_at = next_updated_at(issue.updated_at);

        write_issue_row(&tx, &issue)?;
        record_history(&tx, "reopen", Some(id), None)?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::Reopened(id.clone())]);
        Ok(issue)
    }

    fn add_dep(&self, from: &IssueId, to: &IssueId, kind: DepKind) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut issue = require_issue(&tx, from)?;
        require_issue(&tx, to)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM deps WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3)",
            params![from.as_str(), to.as_str(), kind.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::DepExists {
                from: from.clone(),
                to: to.clone(),
                kind,
            });
        }

        // Forward reachability before insertion keeps the blocks subgraph
        // acyclic (self-edges included: from is reachable from itself).
        if kind == DepKind::Blocks && blocks_reaches(&tx, to, from)? {
            return Err(StoreError::CycleDetected {
                from: from.clone(),
                to: to.clone(),
            });
        }

        tx.execute(
            "INSERT INTO deps (from_id, to_id, kind) VALUES (?1, ?2, ?3)",
            params![from.as_str(), to.as_str(), kind.as_str()],
        )?;
        issue.updated_at = next_updated_at(issue.updated_at);
        write_issue_row(&tx, &issue)?;
        record_history(&tx, "dep_add", Some(from), Some(&format!("{kind} {to}")))?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::DepAdded {
            from: from.clone(),
            to: to.clone(),
            kind,
        }]);
        Ok(())
    }

    fn remove_dep(&self, from: &IssueId, to: &IssueId, kind: DepKind) -> Result<(), StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let mut issue = require_issue(&tx, from)?;
        let removed = tx.execute(
            "DELETE FROM deps WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3",
            params![from.as_str(), to.as_str(), kind.as_str()],
        )?;
        if removed == 0 {
            return Err(StoreError::DepNotFound {
                from: from.clone(),
                to: to.clone(),
                kind,
            });
        }
        issue.updated_at = next_updated_at(issue.updated_at);
        write_issue_row(&tx, &issue)?;
        record_history(&tx, "dep_remove", Some(from), Some(&format!("{kind} {to}")))?;
        tx.commit()?;
        drop(conn);

        self.notify(&[ChangeEvent::DepRemoved {
            from: from.clone(),
            to: to.clone(),
            kind,
        }]);
        Ok(())
    }

    fn import_batch(&self, incoming: Vec<Issue>) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        if incoming.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        // Pass 1: decide and write winning issue rows. Edges wait until
        // every row exists so in-batch forward references resolve.
        let mut applied: Vec<Issue> = Vec::new();
        for candidate in incoming {
            match load_issue(&tx, &candidate.id)? {
                Some(existing) => {
                    if supersedes(&candidate, &existing) {
                        write_issue_row(&tx, &candidate)?;
                        outcome.updated += 1;
                        applied.push(candidate);
                    } else {
                        outcome.ignored_stale += 1;
                    }
                }
                None => {
                    write_issue_row(&tx, &candidate)?;
                    outcome.inserted += 1;
                    applied.push(candidate);
                }
            }
        }

        // Pass 2: replace edges for applied records. Unknown targets are
        // dropped after the deferred retry, and blocks edges pass the
        // same reachability check add_dep enforces: two siblings can
        // each acyclically add opposite blocks edges, so a merged
        // journal is the one place a cycle could otherwise slip in.
        for issue in &applied {
            tx.execute(
                "DELETE FROM deps WHERE from_id = ?1",
                params![issue.id.as_str()],
            )?;
            for dep in &issue.deps {
                let target_exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM issues WHERE id = ?1)",
                    params![dep.to.as_str()],
                    |row| row.get(0),
                )?;
                if !target_exists {
                    outcome.dangling.push((issue.id.clone(), dep.to.clone()));
                    continue;
                }
                if dep.kind == DepKind::Blocks && blocks_reaches(&tx, &dep.to, &issue.id)? {
                    outcome.cycles.push((issue.id.clone(), dep.to.clone()));
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO deps (from_id, to_id, kind) VALUES (?1, ?2, ?3)",
                    params![issue.id.as_str(), dep.to.as_str(), dep.kind.as_str()],
                )?;
            }
        }

        if outcome.inserted + outcome.updated > 0 {
            record_history(
                &tx,
                "import",
                None,
                Some(&format!(
                    "+{} ~{} stale {}",
                    outcome.inserted, outcome.updated, outcome.ignored_stale
                )),
            )?;
        }
        tx.commit()?;
        drop(conn);

        let changed = outcome.inserted + outcome.updated;
        if changed > 0 {
            self.notify(&[ChangeEvent::Imported { changed }]);
        }
        Ok(outcome)
    }

    fn config_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT key, value FROM config")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<BTreeMap<String, String>, _>>()?;
        Ok(pairs)
    }

    fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // Validate recognized keys before persisting.
        Config::default().apply(key, value)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn subscribe(&self, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteStore::init(&tmp.path().join("beads.db"), "bd").unwrap();
        (tmp, store)
    }

    fn quick_create(store: &SqliteStore, title: &str) -> Issue {
        store
            .create(NewIssue {
                title: title.to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn create_show_roundtrip() {
        let (_tmp, store) = store();
        let created = quick_create(&store, "First issue");
        let shown = store.show(&created.id).unwrap();
        assert_eq!(shown, created);
        assert_eq!(shown.status, Status::Open);
        assert_eq!(shown.id.prefix(), "bd");
    }

    #[test]
    fn update_bumps_updated_at_monotonically() {
        let (_tmp, store) = store();
        let created = quick_create(&store, "x");
        let updated = store
            .update(
                &created.id,
                IssuePatch {
                    priority: Some(Priority::HIGHEST),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.priority, Priority::HIGHEST);
    }

    #[test]
    fn optimistic_lock_conflict() {
        let (_tmp, store) = store();
        let created = quick_create(&store, "x");
        store
            .update(
                &created.id,
                IssuePatch {
                    title: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let stale = store.update(
            &created.id,
            IssuePatch {
                title: Some("lost".into()),
                expected_updated_at: Some(created.updated_at),
                ..Default::default()
            },
        );
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
        assert_eq!(store.show(&created.id).unwrap().title, "renamed");
    }

    #[test]
    fn update_to_closed_stamps_closed_at() {
        let (_tmp, store) = store();
        let created = quick_create(&store, "x");
        let updated = store
            .update(
                &created.id,
                IssuePatch {
                    status: Some(Status::Closed),
                    ..Default::default()
                },
            )
            .unwrap();
        // Same contract as close(): no closed issue without a timestamp.
        assert_eq!(updated.status, Status::Closed);
        assert_eq!(updated.closed_at, Some(updated.updated_at));

        // Leaving closed clears it again.
        let reopened = store
            .update(
                &created.id,
                IssuePatch {
                    status: Some(Status::Open),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(reopened.closed_at.is_none());
    }

    #[test]
    fn close_is_soft_and_reopen_clears() {
        let (_tmp, store) = store();
        let created = quick_create(&store, "x");
        let closed = store.close(&created.id, Some("done".into())).unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert_eq!(closed.closed_at, Some(closed.updated_at));

        let reopened = store.reopen(&created.id).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert!(reopened.closed_at.is_none());
        assert!(reopened.close_reason.is_none());
    }

    #[test]
    fn cycle_rejected_and_graph_unchanged() {
        let (_tmp, store) = store();
        let a = quick_create(&store, "a");
        let b = quick_create(&store, "b");

        store.add_dep(&a.id, &b.id, DepKind::Blocks).unwrap();
        let err = store.add_dep(&b.id, &a.id, DepKind::Blocks);
        assert!(matches!(err, Err(StoreError::CycleDetected { .. })));

        // Only the first edge survives.
        let a_after = store.show(&a.id).unwrap();
        let b_after = store.show(&b.id).unwrap();
        assert_eq!(a_after.deps.len(), 1);
        assert!(b_after.deps.is_empty());
    }

    #[test]
    fn transitive_cycle_rejected() {
        let (_tmp, store) = store();
        let a = quick_create(&store, "a");
        let b = quick_create(&store, "b");
        let c = quick_create(&store, "c");
        store.add_dep(&a.id, &b.id, DepKind::Blocks).unwrap();
        store.add_dep(&b.id, &c.id, DepKind::Blocks).unwrap();
        assert!(matches!(
            store.add_dep(&c.id, &a.id, DepKind::Blocks),
            Err(StoreError::CycleDetected { .. })
        ));
        // A non-blocks edge on the same pair is fine.
        store.add_dep(&c.id, &a.id, DepKind::RelatedTo).unwrap();
    }

    #[test]
    fn self_block_rejected() {
        let (_tmp, store) = store();
        let a = quick_create(&store, "a");
        assert!(matches!(
            store.add_dep(&a.id, &a.id, DepKind::Blocks),
            Err(StoreError::CycleDetected { .. })
        ));
    }

    #[test]
    fn ready_excludes_blocked_until_blocker_closes() {
        let (_tmp, store) = store();
        let blocked = quick_create(&store, "blocked one");
        let blocker = quick_create(&store, "blocker");
        store
            .add_dep(&blocked.id, &blocker.id, DepKind::Blocks)
            .unwrap();

        let ready_ids: Vec<IssueId> = store.ready().unwrap().into_iter().map(|i| i.id).collect();
        assert!(ready_ids.contains(&blocker.id));
        assert!(!ready_ids.contains(&blocked.id));

        store.close(&blocker.id, None).unwrap();
        let ready_ids: Vec<IssueId> = store.ready().unwrap().into_iter().map(|i| i.id).collect();
        assert!(ready_ids.contains(&blocked.id));
    }

    #[test]
    fn listeners_fire_after_commit() {
        let (_tmp, store) = store();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        store.subscribe(Box::new(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let issue = quick_create(&store, "x");
        store.close(&issue.id, None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn import_batch_applies_lww() {
        let (_tmp, store) = store();
        let local = quick_create(&store, "local title");

        // Stale copy loses.
        let mut stale = local.clone();
        stale.title = "stale".into();
        stale.updated_at = Timestamp::from_millis(local.updated_at.as_millis() - 10);
        let outcome = store.import_batch(vec![stale]).unwrap();
        assert_eq!(outcome.ignored_stale, 1);
        assert_eq!(store.show(&local.id).unwrap().title, "local title");

        // Newer copy wins.
        let mut newer = local.clone();
        newer.title = "newer".into();
        newer.updated_at = Timestamp::from_millis(local.updated_at.as_millis() + 10);
        let outcome = store.import_batch(vec![newer]).unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(store.show(&local.id).unwrap().title, "newer");
    }

    #[test]
    fn import_batch_resolves_forward_refs_and_reports_dangling() {
        let (_tmp, store) = store();

        let mut first = Issue::new(
            IssueId::parse("bd-aaaaaaa").unwrap(),
            "first".into(),
            Priority::DEFAULT,
            IssueType::Task,
        );
        first.deps.push(DepEdge {
            // Forward reference: target appears later in the batch.
            to: IssueId::parse("bd-bbbbbbb").unwrap(),
            kind: DepKind::Blocks,
        });
        first.deps.push(DepEdge {
            to: IssueId::parse("bd-missing").unwrap(),
            kind: DepKind::RelatedTo,
        });
        let second = Issue::new(
            IssueId::parse("bd-bbbbbbb").unwrap(),
            "second".into(),
            Priority::DEFAULT,
            IssueType::Task,
        );

        let outcome = store.import_batch(vec![first, second]).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.dangling.len(), 1);
        assert_eq!(outcome.dangling[0].1.as_str(), "bd-missing");

        let stored = store.show(&IssueId::parse("bd-aaaaaaa").unwrap()).unwrap();
        assert_eq!(stored.deps.len(), 1);
        assert_eq!(stored.deps[0].to.as_str(), "bd-bbbbbbb");
    }

    #[test]
    fn import_batch_rejects_cycle_forming_blocks_edge() {
        let (_tmp, store) = store();
        let a = quick_create(&store, "a");
        let b = quick_create(&store, "b");
        store.add_dep(&a.id, &b.id, DepKind::Blocks).unwrap();

        // A sibling acyclically added the opposite edge; its record is
        // newer, so the row applies but the edge must not.
        let mut foreign_b = store.show(&b.id).unwrap();
        foreign_b.deps.push(DepEdge {
            to: a.id.clone(),
            kind: DepKind::Blocks,
        });
        foreign_b.updated_at = Timestamp::from_millis(foreign_b.updated_at.as_millis() + 10);

        let outcome = store.import_batch(vec![foreign_b]).unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.cycles.len(), 1);
        assert_eq!(outcome.cycles[0], (b.id.clone(), a.id.clone()));

        // The blocks subgraph stays acyclic: only the original edge.
        assert!(store.show(&b.id).unwrap().deps.is_empty());
        assert_eq!(store.show(&a.id).unwrap().deps.len(), 1);
    }

    #[test]
    fn import_batch_still_applies_non_cycle_edges() {
        let (_tmp, store) = store();
        let a = quick_create(&store, "a");
        let b = quick_create(&store, "b");
        store.add_dep(&a.id, &b.id, DepKind::Blocks).unwrap();

        // related-to on the reverse pair is not a blocks cycle.
        let mut foreign_b = store.show(&b.id).unwrap();
        foreign_b.deps.push(DepEdge {
            to: a.id.clone(),
            kind: DepKind::RelatedTo,
        });
        foreign_b.updated_at = Timestamp::from_millis(foreign_b.updated_at.as_millis() + 10);

        let outcome = store.import_batch(vec![foreign_b]).unwrap();
        assert!(outcome.cycles.is_empty());
        assert_eq!(store.show(&b.id).unwrap().deps.len(), 1);
    }

    #[test]
    fn close_monotonic_under_equal_timestamps() {
        let (_tmp, store) = store();
        let issue = quick_create(&store, "x");
        let closed = store.close(&issue.id, None).unwrap();

        // A reopened record with the same updated_at must not win.
        let mut reopened = closed.clone();
        reopened.status = Status::Open;
        reopened.closed_at = None;
        let outcome = store.import_batch(vec![reopened]).unwrap();
        assert_eq!(outcome.ignored_stale, 1);
        assert_eq!(store.show(&issue.id).unwrap().status, Status::Closed);
    }

    #[test]
    fn config_roundtrip_and_validation() {
        let (_tmp, store) = store();
        store.config_set("git.auto_push", "true").unwrap();
        assert!(store.config_set("daemon.mode", "sideways").is_err());
        let config = store.config().unwrap();
        assert!(config.git_auto_push);
        assert_eq!(config.issue_prefix, "bd");
    }
}
