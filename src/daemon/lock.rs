//! The daemon sentinel lock.
//!
//! One supervisor per database: startup creates `daemon.lock` with
//! `create_new` and JSON metadata (pid, start time). A lock held by a
//! live pid means another supervisor owns the database. A dead pid is
//! stolen; when two stealers race, exactly one `create_new` succeeds and
//! the loser observes a live holder on re-read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Timestamp;

#[derive(Debug, Error)]
pub enum DaemonLockError {
    #[error("daemon already running (pid {pid}) for lock {path:?}")]
    Held { pid: u32, path: PathBuf },
    #[error("daemon lock metadata corrupted at {path:?}: {source}")]
    MetadataCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("daemon lock io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockMeta {
    pub pid: u32,
    pub started_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<i64>,
}

impl DaemonLockMeta {
    pub fn alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
    meta: DaemonLockMeta,
    released: bool,
}

impl DaemonLock {
    pub fn acquire(path: &Path) -> Result<Self, DaemonLockError> {
        let meta = DaemonLockMeta {
            pid: std::process::id(),
            started_at_ms: Timestamp::now().as_millis(),
            last_heartbeat_ms: None,
        };

        match write_new(path, &meta) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // Corrupt metadata counts as a dead holder.
                let holder = match read_meta(path) {
                    Ok(holder) => holder,
                    Err(DaemonLockError::MetadataCorrupt { .. }) => None,
                    Err(err) => return Err(err),
                };
                match holder {
                    Some(holder) if holder.alive() => {
                        return Err(DaemonLockError::Held {
                            pid: holder.pid,
                            path: path.to_path_buf(),
                        })
                    }
                    // Dead or unreadable holder: steal. Racing stealers
                    // may interleave remove/create, so the winner is
                    // whoever's file survives: verify by re-read.
                    _ => {
                        let _ = fs::remove_file(path);
                        return match write_new(path, &meta) {
                            Ok(()) => {
                                let survivor = read_meta(path).ok().flatten();
                                match survivor {
                                    Some(m) if m.pid == meta.pid => Ok(DaemonLock {
                                        path: path.to_path_buf(),
                                        meta,
                                        released: false,
                                    }),
                                    other => Err(DaemonLockError::Held {
                                        pid: other.map(|m| m.pid).unwrap_or_default(),
                                        path: path.to_path_buf(),
                                    }),
                                }
                            }
                            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                                let pid = read_meta(path)
                                    .ok()
                                    .flatten()
                                    .map(|m| m.pid)
                                    .unwrap_or_default();
                                Err(DaemonLockError::Held {
                                    pid,
                                    path: path.to_path_buf(),
                                })
                            }
                            Err(source) => Err(DaemonLockError::Io {
                                path: path.to_path_buf(),
                                source,
                            }),
                        };
                    }
                }
            }
            Err(source) => {
                return Err(DaemonLockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        Ok(DaemonLock {
            path: path.to_path_buf(),
            meta,
            released: false,
        })
    }

    pub fn meta(&self) -> &DaemonLockMeta {
        &self.meta
    }

    /// Refresh the heartbeat stamp so `daemons health` can tell a wedged
    /// daemon from a busy one.
    pub fn touch(&mut self) -> Result<(), DaemonLockError> {
        self.meta.last_heartbeat_ms = Some(Timestamp::now().as_millis());
        let bytes =
            serde_json::to_vec(&self.meta).map_err(|source| DaemonLockError::MetadataCorrupt {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, bytes).map_err(|source| DaemonLockError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn release(mut self) {
        let _ = fs::remove_file(&self.path);
        self.released = true;
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Read lock metadata without acquiring (daemons list/health).
pub fn read_meta(path: &Path) -> Result<Option<DaemonLockMeta>, DaemonLockError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| DaemonLockError::MetadataCorrupt {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(DaemonLockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_new(path: &Path, meta: &DaemonLockMeta) -> io::Result<()> {
    use std::io::Write;

    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(&serde_json::to_vec(meta).expect("lock metadata serializes"))?;
    file.sync_all()
}

/// Signal-0 liveness probe.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        // EPERM and friends: the process exists but is not ours.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_second_acquire_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.lock");

        let lock = DaemonLock::acquire(&path).unwrap();
        match DaemonLock::acquire(&path) {
            Err(DaemonLockError::Held { pid, .. }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected Held, got {other:?}"),
        }
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn dead_pid_is_stolen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.lock");
        let stale = DaemonLockMeta {
            pid: 999_999_999,
            started_at_ms: 0,
            last_heartbeat_ms: None,
        };
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let lock = DaemonLock::acquire(&path).unwrap();
        assert_eq!(lock.meta().pid, std::process::id());
    }

    #[test]
    fn corrupt_lock_is_stolen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.lock");
        fs::write(&path, "not json").unwrap();

        match DaemonLock::acquire(&path) {
            Ok(lock) => assert_eq!(lock.meta().pid, std::process::id()),
            Err(err) => panic!("corrupt lock should be stolen, got {err:?}"),
        }
    }

    #[test]
    fn touch_updates_heartbeat() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.lock");

        let mut lock = DaemonLock::acquire(&path).unwrap();
        lock.touch().unwrap();
        let meta = read_meta(&path).unwrap().unwrap();
        assert!(meta.last_heartbeat_ms.is_some());
    }

    #[test]
    fn self_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(999_999_999));
    }
}
