//! Resolution of the `.beads` directory and the files inside it.
//!
//! Precedence: `BEADS_DIR` env override, then the nearest `.beads`
//! directory walking up from the working directory, then `<cwd>/.beads`.
//! `BEADS_DB` overrides only the database path.

use std::path::{Path, PathBuf};

pub const BEADS_DIR_ENV: &str = "BEADS_DIR";
pub const BEADS_DB_ENV: &str = "BEADS_DB";
pub const DAEMON_MODE_ENV: &str = "BEADS_DAEMON_MODE";
pub const LOG_ENV: &str = "BEADS_LOG";

const DIR_NAME: &str = ".beads";

/// All well-known locations for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeadsPaths {
    base: PathBuf,
}

impl BeadsPaths {
    /// Resolve from a starting directory, honoring env overrides.
    pub fn discover(start: &Path) -> Self {
        if let Some(dir) = non_empty_env(BEADS_DIR_ENV) {
            return BeadsPaths { base: PathBuf::from(dir) };
        }

        let mut cursor = Some(start);
        while let Some(dir) = cursor {
            let candidate = dir.join(DIR_NAME);
            if candidate.is_dir() {
                return BeadsPaths { base: candidate };
            }
            cursor = dir.parent();
        }

        BeadsPaths {
            base: start.join(DIR_NAME),
        }
    }

    /// Use an explicit base directory (tests, `init --dir`).
    pub fn at(base: PathBuf) -> Self {
        BeadsPaths { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The git working tree the database lives in.
    pub fn repo_root(&self) -> &Path {
        self.base.parent().unwrap_or(&self.base)
    }

    pub fn db(&self) -> PathBuf {
        if let Some(db) = non_empty_env(BEADS_DB_ENV) {
            return PathBuf::from(db);
        }
        self.base.join("beads.db")
    }

    pub fn journal(&self) -> PathBuf {
        self.base.join("issues.jsonl")
    }

    /// Journal path relative to the repo root, as git sees it.
    pub fn journal_rel(&self) -> PathBuf {
        self.journal()
            .strip_prefix(self.repo_root())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.journal())
    }

    pub fn daemon_lock(&self) -> PathBuf {
        self.base.join("daemon.lock")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.base.join("daemon.log")
    }

    pub fn sync_lock(&self) -> PathBuf {
        self.base.join("sync.lock")
    }

    pub fn gitignore(&self) -> PathBuf {
        self.base.join(".gitignore")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Entries inside `.beads` that must never reach git.
pub const GITIGNORED: &[&str] = &[
    "beads.db",
    "beads.db-wal",
    "beads.db-shm",
    "daemon.lock",
    "daemon.log",
    "sync.lock",
];

/// Create or amend `.beads/.gitignore` with the local-only entries.
pub fn ensure_gitignore(paths: &BeadsPaths) -> std::io::Result<()> {
    use std::io::Write;

    let path = paths.gitignore();
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    let missing: Vec<&str> = GITIGNORED
        .iter()
        .copied()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    for entry in missing {
        writeln!(file, "{entry}")?;
    }
    Ok(())
}
