//! The daemon: debouncers, watcher, locks, hooks, and the supervisor
//! that ties them to the action queue.

pub mod debounce;
pub mod hooks;
pub mod lock;
pub mod supervisor;
pub mod watch;

pub use debounce::Debouncer;
pub use hooks::{install as install_hooks, HookError, HookOutcome, HookReport};
pub use lock::{pid_alive, read_meta as read_daemon_lock, DaemonLock, DaemonLockError, DaemonLockMeta};
pub use supervisor::{run_daemon, DaemonError, Supervisor};
pub use watch::{JournalWatcher, WatchMode};
