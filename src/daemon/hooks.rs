//! Git hook installer.
//!
//! Four managed hooks force synchronous journal work at the moments git
//! rewrites history around us: export before a commit or push leaves the
//! machine, import after a merge or branch switch changes the journal
//! underneath us. Managed scripts carry a version-stamped header;
//! anything else in the way is preserved and reported.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

const HEADER_PREFIX: &str = "# beads-hook v";
const HOOK_VERSION: u32 = 1;

/// (hook name, --sync-now action)
const HOOKS: [(&str, &str); 4] = [
    ("pre-commit", "export"),
    ("post-merge", "import"),
    ("pre-push", "export"),
    ("post-checkout", "import"),
];

#[derive(Debug, Error)]
pub enum HookError {
    #[error("cannot locate git hooks directory under {0:?}")]
    NoHooksDir(PathBuf),
    #[error("hook io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    Installed,
    Updated,
    /// A user-authored hook occupies the slot; left untouched.
    SkippedForeign,
}

#[derive(Debug, serde::Serialize)]
pub struct HookReport {
    pub hook: &'static str,
    pub outcome: HookOutcome,
}

fn script(exe: &str, action: &str, hook: &str) -> String {
    format!(
        "#!/bin/sh\n{HEADER_PREFIX}{HOOK_VERSION} ({hook})\n\
         # Managed by `bd hooks install`; edits will be overwritten.\n\
         exec \"{exe}\" --sync-now {action}\n"
    )
}

/// The binary the hooks should call back into: this process's own
/// executable, falling back to `bd` on PATH.
fn self_exe() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "bd".to_string())
}

/// Resolve the hooks directory the way git does (worktrees and
/// `core.hooksPath` included).
pub fn hooks_dir(repo_root: &Path) -> Result<PathBuf, HookError> {
    let output = Command::new("git")
        .args(["rev-parse", "--git-path", "hooks"])
        .current_dir(repo_root)
        .output()
        .map_err(|source| HookError::Io {
            path: repo_root.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(HookError::NoHooksDir(repo_root.to_path_buf()));
    }
    let rel = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let path = PathBuf::from(&rel);
    Ok(if path.is_absolute() {
        path
    } else {
        repo_root.join(path)
    })
}

pub fn install(repo_root: &Path) -> Result<Vec<HookReport>, HookError> {
    install_into(&hooks_dir(repo_root)?)
}

/// Idempotent: managed hooks are overwritten in place, foreign hooks are
/// preserved.
pub fn install_into(dir: &Path) -> Result<Vec<HookReport>, HookError> {
    std::fs::create_dir_all(dir).map_err(|source| HookError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut reports = Vec::with_capacity(HOOKS.len());
    for (hook, action) in HOOKS {
        let path = dir.join(hook);
        let io_err = |source| HookError::Io {
            path: path.clone(),
            source,
        };

        let outcome = match std::fs::read_to_string(&path) {
            Ok(existing) if !is_managed(&existing) => {
                tracing::warn!(hook, path = ?path, "foreign hook present, not overwriting");
                HookOutcome::SkippedForeign
            }
            Ok(_) => HookOutcome::Updated,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HookOutcome::Installed,
            Err(source) => return Err(io_err(source)),
        };

        if outcome != HookOutcome::SkippedForeign {
            std::fs::write(&path, script(&self_exe(), action, hook)).map_err(io_err)?;
            make_executable(&path).map_err(io_err)?;
        }
        reports.push(HookReport { hook, outcome });
    }
    Ok(reports)
}

fn is_managed(content: &str) -> bool {
    content.lines().take(3).any(|l| l.starts_with(HEADER_PREFIX))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
