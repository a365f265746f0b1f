//! Cross-process journal write lock.
//!
//! Exports and imports may run from the daemon, from one-shot CLI
//! invocations, and from git hooks at the same time. All of them
//! serialize on this advisory lock file next to the journal. Acquisition
//! backs off exponentially; a lock left behind by a dead process is
//! stolen.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_WAIT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Error)]
pub enum SyncLockError {
    #[error("journal lock at {path:?} held by pid {pid} after {waited_ms}ms")]
    Contended {
        path: PathBuf,
        pid: u32,
        waited_ms: u64,
    },
    #[error("journal lock io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the duration of one export or import. Released on drop.
#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
}

impl SyncLock {
    pub fn acquire(path: &Path) -> Result<Self, SyncLockError> {
        let pid = std::process::id();
        let mut backoff = INITIAL_BACKOFF;
        let mut waited = Duration::ZERO;

        loop {
            match try_create(path, pid) {
                Ok(()) => {
                    return Ok(SyncLock {
                        path: path.to_path_buf(),
                    })
                }
                Err(TryCreateError::Held(holder)) => {
                    if waited >= MAX_WAIT {
                        return Err(SyncLockError::Contended {
                            path: path.to_path_buf(),
                            pid: holder,
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    thread::sleep(backoff);
                    waited += backoff;
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Err(TryCreateError::Io(source)) => {
                    return Err(SyncLockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

enum TryCreateError {
    Held(u32),
    Io(std::io::Error),
}

fn try_create(path: &Path, pid: u32) -> Result<(), TryCreateError> {
    use std::io::Write;

    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = write!(file, "{pid}");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            match holder {
                Some(holder) if holder != pid && crate::daemon::pid_alive(holder) => {
                    Err(TryCreateError::Held(holder))
                }
                Some(_) | None => {
                    // Dead holder or unreadable content: steal and retry.
                    let _ = fs::remove_file(path);
                    try_create(path, pid)
                }
            }
        }
        Err(err) => Err(TryCreateError::Io(err)),
    }
}
