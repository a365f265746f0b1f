//! Verb-level operations. The CLI dispatches here; everything below is
//! also usable as a library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, RoutingMode};
use crate::core::{DepKind, Issue, IssueId, Status};
use crate::daemon::{self, DaemonLockMeta, HookReport};
use crate::error::{Error, Result};
use crate::git::{GitBridge, PullOutcome};
use crate::journal::{self, ImportReport};
use crate::paths::{self, BeadsPaths};
use crate::store::{NewIssue, SqliteStore, StoreBackend};

/// One opened database plus its location.
pub struct Workspace {
    paths: BeadsPaths,
    store: Arc<SqliteStore>,
}

impl Workspace {
    /// Create a new database under `<root>/.beads`.
    pub fn init(root: &Path, prefix: Option<String>) -> Result<Workspace> {
        let paths = BeadsPaths::at(root.join(".beads"));
        std::fs::create_dir_all(paths.base())
            .map_err(|e| Error::usage(format!("cannot create {:?}: {e}", paths.base())))?;

        let prefix = prefix.unwrap_or_else(|| infer_prefix(root));
        let store = Arc::new(SqliteStore::init(&paths.db(), &prefix)?);
        paths::ensure_gitignore(&paths)
            .map_err(|e| Error::usage(format!("cannot write .gitignore: {e}")))?;

        let workspace = Workspace { paths, store };
        // Absorb a pre-existing journal (re-init, cloned repo) instead
        // of truncating it, then materialize the file so it is
        // committable immediately after init.
        if workspace.paths.journal().exists() {
            workspace.import(None)?;
        }
        workspace.export()?;

        Ok(workspace)
    }

    /// Open the database the working directory belongs to.
    pub fn open_current() -> Result<Workspace> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::usage(format!("cannot resolve working directory: {e}")))?;
        let paths = BeadsPaths::discover(&cwd);
        Workspace::open(paths)
    }

    pub fn open(paths: BeadsPaths) -> Result<Workspace> {
        if !paths.db().exists() {
            // A fresh clone has the journal but not the (gitignored)
            // database: bootstrap one from the journal.
            if !paths.journal().exists() {
                return Err(Error::usage(format!(
                    "no beads database at {:?}; run `bd init` first",
                    paths.db()
                )));
            }
            let store = Arc::new(SqliteStore::open(&paths.db())?);
            let workspace = Workspace { paths, store };
            let report = workspace.import(None)?;
            if let Some(prefix) = workspace
                .store
                .list(&Default::default())?
                .first()
                .map(|issue| issue.id.prefix().to_string())
            {
                workspace
                    .store
                    .config_set(crate::config::KEY_ISSUE_PREFIX, &prefix)?;
            }
            tracing::info!(
                imported = report.changed(),
                "bootstrapped database from journal"
            );
            return Ok(workspace);
        }
        let store = Arc::new(SqliteStore::open(&paths.db())?);
        Ok(Workspace { paths, store })
    }

    pub fn paths(&self) -> &BeadsPaths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn config(&self) -> Result<Config> {
        Ok(self.store.config()?)
    }

    fn bridge(&self) -> Result<GitBridge> {
        let config = self.config()?;
        Ok(GitBridge::new(
            self.paths.repo_root(),
            &self.paths.journal_rel(),
            config.git_branch,
        ))
    }

    /// Create an issue, honoring `routing.mode`: in auto mode with a
    /// planning database configured, the issue lands there instead.
    pub fn create(&self, new: NewIssue) -> Result<Issue> {
        let config = self.config()?;
        if config.routing_mode == RoutingMode::Auto {
            if let Some(planning) = &config.planning_db {
                let db = resolve_db_path(self.paths.repo_root(), planning);
                if db != self.paths.db() {
                    tracing::debug!(db = ?db, "routing create to planning database");
                    let planning_store = SqliteStore::open(&db)?;
                    return Ok(planning_store.create(new)?);
                }
            }
        }
        Ok(self.store.create(new)?)
    }

    /// Export the store to the journal file.
    pub fn export(&self) -> Result<journal::ExportOutcome> {
        Ok(journal::export(self.store.as_ref(), &self.paths)?)
    }

    /// Import the journal (or an arbitrary file) into the store.
    pub fn import(&self, file: Option<&Path>) -> Result<ImportReport> {
        match file {
            Some(file) => Ok(journal::import_file(
                self.store.as_ref(),
                &self.paths,
                file,
            )?),
            None => Ok(journal::import(self.store.as_ref(), &self.paths)?),
        }
    }

    /// Synchronous full cycle: flush, commit, pull, import, re-export,
    /// commit, push. Works with or without a running daemon.
    pub fn sync(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let bridge = self.bridge()?;

        let outcome = self.export()?;
        summary.exported = outcome.written;

        if !bridge.is_repo() {
            // No git, nothing more to sync; the journal is still fresh.
            summary.imported = self.import(None)?.changed();
            return Ok(summary);
        }

        if let Some(hash) = bridge.commit(&commit_message(outcome.records))? {
            summary.committed = Some(hash);
        }

        if bridge.has_remote() {
            match bridge.pull()? {
                PullOutcome::Clean => {}
                PullOutcome::JournalResolved => summary.resolved_conflict = true,
            }
            // Separate-branch mode merges through the fetched blob
            // rather than the working tree.
            if let Some(remote) = bridge.fetched_sync_journal()? {
                let temp = self.paths.base().join("remote.jsonl.tmp");
                std::fs::write(&temp, remote)
                    .map_err(|e| Error::usage(format!("cannot stage remote journal: {e}")))?;
                let imported = self.import(Some(&temp));
                let _ = std::fs::remove_file(&temp);
                summary.imported += imported?.changed();
            }
        }

        summary.imported += self.import(None)?.changed();

        // Local-only changes the pull clobbered in the file come back in
        // the re-export; commit again so the remote sees the merge.
        let outcome = self.export()?;
        if outcome.written {
            if let Some(hash) = bridge.commit(&commit_message(outcome.records))? {
                summary.committed = Some(hash);
            }
        }

        if bridge.has_remote() {
            bridge.push()?;
            summary.pushed = true;
        }
        Ok(summary)
    }

    /// The `--sync-now` sentinel used by git hooks: one synchronous
    /// action, no debounce.
    pub fn sync_now(&self, action: SyncNowAction) -> Result<()> {
        match action {
            SyncNowAction::Export => {
                let outcome = self.export()?;
                let bridge = self.bridge()?;
                if bridge.is_repo() {
                    if self.config()?.git_branch.is_some() {
                        // Plumbing commit: never touches the index, so it
                        // is safe inside a running pre-commit hook.
                        let _ = bridge.commit(&commit_message(outcome.records));
                    } else if outcome.written {
                        // Stage only: the in-flight commit (pre-commit)
                        // or the next one picks the journal up.
                        bridge.stage()?;
                    }
                }
                Ok(())
            }
            SyncNowAction::Import => {
                self.import(None)?;
                Ok(())
            }
        }
    }

    pub fn doctor(&self) -> Result<DoctorReport> {
        let mut report = DoctorReport::default();
        let store = self.store.as_ref();

        // Journal health: parseable, and in sync with the store.
        let journal_path = self.paths.journal();
        let content = std::fs::read_to_string(&journal_path).unwrap_or_default();
        match journal::decode_journal(&content) {
            Ok(decoded) => {
                report.push(
                    "journal_parse",
                    decoded.malformed.is_empty(),
                    format!("{} malformed line(s)", decoded.malformed.len()),
                );
            }
            Err(err) => report.push("journal_parse", false, err.to_string()),
        }

        let rendered = journal::render(store)?;
        report.push(
            "export_deterministic",
            rendered == journal::render(store)?,
            "two renders byte-identical".into(),
        );
        report.push(
            "journal_fresh",
            rendered == content,
            "journal file matches store state".into(),
        );

        // Dangling references inside the store.
        let issues = store.list(&Default::default())?;
        let known: std::collections::HashSet<&IssueId> = issues.iter().map(|i| &i.id).collect();
        let mut dangling = Vec::new();
        for issue in &issues {
            for dep in &issue.deps {
                if !known.contains(&dep.to) {
                    dangling.push(format!("{} -> {}", issue.id, dep.to));
                }
            }
        }
        report.push(
            "dangling_references",
            dangling.is_empty(),
            if dangling.is_empty() {
                "none".into()
            } else {
                dangling.join(", ")
            },
        );

        // Stale daemon lock.
        match daemon::read_daemon_lock(&self.paths.daemon_lock()) {
            Ok(Some(meta)) if !meta.alive() => report.push(
                "daemon_lock",
                false,
                format!("stale lock held by dead pid {}", meta.pid),
            ),
            Ok(_) => report.push("daemon_lock", true, "clean".into()),
            Err(err) => report.push("daemon_lock", false, err.to_string()),
        }

        // Orphans: issues referenced by commit subjects but still open.
        let bridge = self.bridge()?;
        if bridge.is_repo() {
            let prefix = self.config()?.issue_prefix;
            let mut orphans = Vec::new();
            for subject in bridge.head_subjects(500)? {
                for id in IssueId::scan(&subject, &prefix) {
                    if let Ok(issue) = store.show(&id) {
                        if issue.status != Status::Closed && !orphans.contains(&id) {
                            orphans.push(id);
                        }
                    }
                }
            }
            report.orphans = orphans;
            let ok = report.orphans.is_empty();
            let detail = if ok {
                "none".to_string()
            } else {
                report
                    .orphans
                    .iter()
                    .map(IssueId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            report.push("orphans", ok, detail);
        }

        Ok(report)
    }

    pub fn daemons_list(&self) -> Result<Vec<DaemonStatus>> {
        let meta = daemon::read_daemon_lock(&self.paths.daemon_lock())
            .map_err(|e| Error::Daemon(e.into()))?;
        Ok(meta
            .map(|meta| {
                vec![DaemonStatus {
                    alive: meta.alive(),
                    db: self.paths.db(),
                    meta,
                }]
            })
            .unwrap_or_default())
    }

    /// Terminate the daemon attached to this database, reaping a stale
    /// lock if the pid is already gone.
    pub fn daemons_killall(&self) -> Result<usize> {
        let mut killed = 0;
        for status in self.daemons_list()? {
            if status.alive {
                terminate(status.meta.pid);
                killed += 1;
            } else {
                let _ = std::fs::remove_file(self.paths.daemon_lock());
            }
        }
        Ok(killed)
    }

    pub fn install_hooks(&self) -> Result<Vec<HookReport>> {
        Ok(daemon::install_hooks(self.paths.repo_root())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SyncNowAction {
    Export,
    Import,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct SyncSummary {
    pub exported: bool,
    pub committed: Option<String>,
    pub imported: usize,
    pub resolved_conflict: bool,
    pub pushed: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct DaemonStatus {
    pub alive: bool,
    pub db: PathBuf,
    #[serde(flatten)]
    pub meta: DaemonLockMeta,
}

#[derive(Debug, serde::Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
    pub orphans: Vec<IssueId>,
}

impl DoctorReport {
    fn push(&mut self, name: &'static str, ok: bool, detail: String) {
        self.checks.push(DoctorCheck { name, ok, detail });
    }

    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

fn commit_message(records: usize) -> String {
    format!("beads: sync journal ({records} issues)")
}

fn infer_prefix(root: &Path) -> String {
    root.file_name()
        .and_then(|n| n.to_str())
        .map(|n| {
            n.to_lowercase()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(8)
                .collect::<String>()
        })
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| crate::config::DEFAULT_PREFIX.to_string())
}

fn resolve_db_path(repo_root: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Parse `to:kind` or bare `to` (defaults to blocks) for `--dep` flags.
pub fn parse_dep_spec(spec: &str) -> Result<(IssueId, DepKind)> {
    match spec.split_once(':') {
        Some((id, kind)) => Ok((IssueId::parse(id)?, kind.parse()?)),
        None => Ok((IssueId::parse(spec)?, DepKind::Blocks)),
    }
}
