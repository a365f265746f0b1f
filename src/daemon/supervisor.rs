//! The daemon supervisor.
//!
//! One process per database. Hosts the export debouncer (store changes →
//! journal + git commit), the import debouncer (watcher events → store
//! merge), and a heartbeat (lock refresh + optional auto pull/push). All
//! three feed a single action queue consumed by one thread, so export,
//! import, and git operations are mutually exclusive by construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use super::debounce::Debouncer;
use super::lock::{DaemonLock, DaemonLockError};
use super::watch::{JournalWatcher, WatchMode};
use crate::config::{Config, HEARTBEAT_INTERVAL, IMPORT_DEBOUNCE};
use crate::git::{GitBridge, GitError, PullOutcome};
use crate::journal::{self, ExportError, ImportError};
use crate::paths::BeadsPaths;
use crate::store::{ChangeEvent, SqliteStore, StoreBackend, StoreError};

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const INTERNAL_ERROR_WINDOW: Duration = Duration::from_secs(60);
const INTERNAL_ERROR_LIMIT: u32 = 3;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Lock(#[from] DaemonLockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("supervisor terminated after repeated internal errors: {last}")]
    RepeatedInternal { last: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Export,
    Import,
    Heartbeat,
}

pub struct Supervisor {
    paths: BeadsPaths,
    store: Arc<SqliteStore>,
    config: Config,
    bridge: GitBridge,
    lock: DaemonLock,
    actions_rx: Receiver<Action>,
    actions_tx: Sender<Action>,
    export_debouncer: Arc<Debouncer>,
    import_debouncer: Arc<Debouncer>,
    /// Set while an import runs so the resulting store events do not
    /// re-trigger an export of what we just read from disk.
    importing: Arc<AtomicBool>,
    watcher: JournalWatcher,
    _watch_pump: std::thread::JoinHandle<()>,
    internal_errors: Vec<Instant>,
    /// High-water mark of the store's history counter, for noticing
    /// writes from sibling processes (CLI one-shots, hook invocations).
    history_seen: i64,
}

impl Supervisor {
    /// Acquire the daemon lock and wire up debouncers, watcher, and
    /// store subscription. Fails with `Lock(Held)` when another
    /// supervisor owns this database.
    pub fn start(paths: BeadsPaths, store: Arc<SqliteStore>) -> Result<Self, DaemonError> {
        let config = store.config()?;
        let lock = DaemonLock::acquire(&paths.daemon_lock())?;

        let bridge = GitBridge::new(
            paths.repo_root(),
            &paths.journal_rel(),
            config.git_branch.clone(),
        );

        let (actions_tx, actions_rx) = unbounded();

        let export_tx = actions_tx.clone();
        let export_debouncer = Arc::new(Debouncer::new(
            config.export_debounce,
            Box::new(move || {
                let _ = export_tx.send(Action::Export);
            }),
        ));

        let import_tx = actions_tx.clone();
        let import_debouncer = Arc::new(Debouncer::new(
            IMPORT_DEBOUNCE,
            Box::new(move || {
                let _ = import_tx.send(Action::Import);
            }),
        ));

        // Store changes drive the export debouncer, unless they came
        // from our own import.
        let importing = Arc::new(AtomicBool::new(false));
        {
            let export_debouncer = Arc::clone(&export_debouncer);
            let importing = Arc::clone(&importing);
            store.subscribe(Box::new(move |event: &ChangeEvent| {
                if importing.load(Ordering::Relaxed) {
                    return;
                }
                if matches!(event, ChangeEvent::Imported { .. }) {
                    return;
                }
                export_debouncer.trigger();
            }));
        }

        // Watcher events drive the import debouncer through a pump
        // thread; the watcher itself never touches the debouncer lock.
        let (watch_tx, watch_rx) = unbounded::<()>();
        let watcher = JournalWatcher::spawn(
            paths.journal(),
            config.effective_daemon_mode(),
            config.poll_interval,
            watch_tx,
        );
        let watch_pump = {
            let import_debouncer = Arc::clone(&import_debouncer);
            std::thread::Builder::new()
                .name("watch-pump".into())
                .spawn(move || {
                    while watch_rx.recv().is_ok() {
                        import_debouncer.trigger();
                    }
                })
                .expect("spawning watch pump")
        };

        tracing::info!(
            pid = std::process::id(),
            db = ?paths.db(),
            mode = ?watcher.mode(),
            debounce_ms = config.export_debounce.as_millis() as u64,
            "supervisor started"
        );

        Ok(Supervisor {
            paths,
            store,
            config,
            bridge,
            lock,
            actions_rx,
            actions_tx,
            export_debouncer,
            import_debouncer,
            importing,
            watcher,
            _watch_pump: watch_pump,
            internal_errors: Vec::new(),
            // Start at zero so a journal left stale by a crash gets one
            // (possibly no-op) export shortly after startup.
            history_seen: 0,
        })
    }

    pub fn watch_mode(&self) -> WatchMode {
        self.watcher.mode()
    }

    /// Consume the action queue until `shutdown` is set, then flush
    /// pending debouncers, drain the queue, and release the lock.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<(), DaemonError> {
        let mut next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if Instant::now() >= next_heartbeat {
                next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
                let _ = self.actions_tx.send(Action::Heartbeat);
            }

            // Mutations from sibling processes only show up in the
            // history counter; an advance arms the export debouncer.
            // Spurious arms are free: identical exports skip the rename.
            if let Ok(seq) = self.store.history_seq() {
                if seq > self.history_seen {
                    self.history_seen = seq;
                    self.export_debouncer.trigger();
                }
            }

            match self.actions_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(action) => self.execute_with_retry(action)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::info!("supervisor shutting down");
        self.export_debouncer.flush(SHUTDOWN_FLUSH_TIMEOUT);
        self.import_debouncer.flush(SHUTDOWN_FLUSH_TIMEOUT);
        while let Ok(action) = self.actions_rx.try_recv() {
            self.execute_with_retry(action)?;
        }

        self.lock.release();
        tracing::info!("supervisor stopped");
        Ok(())
    }

    /// Git errors are retried once at the queue level; everything else
    /// is logged. Repeated internal errors in a short window terminate.
    fn execute_with_retry(&mut self, action: Action) -> Result<(), DaemonError> {
        match self.execute(action) {
            Ok(()) => Ok(()),
            Err(DaemonError::Git(err)) if err.is_retryable() => {
                tracing::warn!(?action, error = %err, "git action failed, retrying once");
                match self.execute(action) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        tracing::error!(?action, error = %err, "git action failed after retry");
                        Ok(())
                    }
                }
            }
            Err(DaemonError::Store(StoreError::Internal(message))) => {
                self.note_internal(&message)
            }
            Err(err) => {
                tracing::error!(?action, error = %err, "action failed");
                Ok(())
            }
        }
    }

    fn note_internal(&mut self, message: &str) -> Result<(), DaemonError> {
        let now = Instant::now();
        self.internal_errors
            .retain(|at| now.duration_since(*at) < INTERNAL_ERROR_WINDOW);
        self.internal_errors.push(now);
        tracing::error!(error = message, "internal error");
        if self.internal_errors.len() as u32 >= INTERNAL_ERROR_LIMIT {
            return Err(DaemonError::RepeatedInternal {
                last: message.to_string(),
            });
        }
        Ok(())
    }

    fn execute(&mut self, action: Action) -> Result<(), DaemonError> {
        match action {
            Action::Export => self.do_export(),
            Action::Import => self.do_import(),
            Action::Heartbeat => self.do_heartbeat(),
        }
    }

    fn do_export(&mut self) -> Result<(), DaemonError> {
        let outcome = journal::export(self.store.as_ref(), &self.paths)?;
        if !outcome.written {
            return Ok(());
        }
        tracing::info!(records = outcome.records, "journal exported");

        if self.config.git_auto_commit && self.bridge.is_repo() {
            let message = format!("beads: sync journal ({} issues)", outcome.records);
            if let Some(hash) = self.bridge.commit(&message)? {
                tracing::info!(commit = %hash, "journal committed");
            }
            if self.config.git_auto_push && self.bridge.has_remote() {
                self.bridge.push()?;
            }
        }
        Ok(())
    }

    fn do_import(&mut self) -> Result<(), DaemonError> {
        self.importing.store(true, Ordering::Relaxed);
        let result = journal::import(self.store.as_ref(), &self.paths);
        self.importing.store(false, Ordering::Relaxed);

        let report = result?;
        if report.changed() > 0 {
            tracing::info!(
                inserted = report.inserted,
                updated = report.updated,
                stale = report.ignored_stale,
                "journal imported"
            );
        }
        Ok(())
    }

    fn do_heartbeat(&mut self) -> Result<(), DaemonError> {
        if let Err(err) = self.lock.touch() {
            tracing::warn!(error = %err, "heartbeat lock refresh failed");
        }

        if !self.bridge.is_repo() || !self.bridge.has_remote() {
            return Ok(());
        }
        if self.config.git_auto_pull {
            match self.bridge.pull()? {
                PullOutcome::Clean => {}
                PullOutcome::JournalResolved => {
                    // Remote version won the file; merge it through the
                    // store, then re-export so local-only changes get
                    // back into the journal and out to the remote.
                    self.do_import()?;
                    self.do_export()?;
                }
            }
            // Any pull may have rewritten the journal; the watcher will
            // debounce an import shortly. Trigger directly as well in
            // case the rewrite landed between watcher polls.
            self.import_debouncer.trigger();
        }
        if self.config.git_auto_push {
            self.bridge.push()?;
        }
        Ok(())
    }
}

/// Foreground daemon entry point: signal handling plus the run loop.
pub fn run_daemon(paths: BeadsPaths) -> Result<(), DaemonError> {
    let store = Arc::new(SqliteStore::open(&paths.db())?);

    let shutdown = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));
    }

    let supervisor = Supervisor::start(paths, store)?;
    supervisor.run(shutdown)
}
