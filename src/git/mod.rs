//! Git bridge.
//!
//! Every git call is a subprocess spawned in the repository root with a
//! deadline; a child that outlives its deadline is killed and surfaces
//! as `Timeout`. The bridge knows exactly one file, the journal, and two
//! publishing modes: committing on the current branch, or committing to
//! a dedicated sync branch via plumbing when the default branch is
//! protected (`git.branch` config).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not a git repository: {0:?}")]
    NotARepo(PathBuf),
    #[error("git not installed or not in PATH")]
    GitNotFound,
    #[error("git {op} timed out after {timeout_ms}ms")]
    Timeout { op: String, timeout_ms: u64 },
    #[error("git {op} failed: {stderr}")]
    CommandFailed { op: String, stderr: String },
    #[error("merge conflict needs human attention in: {files:?}")]
    ConflictNeedsHuman { files: Vec<String> },
    #[error("push failed after pull-and-retry: {stderr}")]
    PushFailed { stderr: String },
    #[error("git io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitError::Timeout { .. } | GitError::PushFailed { .. })
    }
}

#[derive(Debug)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// What a `pull` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing to pull, or fast-forward / clean rebase.
    Clean,
    /// A journal-only conflict was auto-resolved in favor of the remote;
    /// the caller must re-import and re-export so local changes survive.
    JournalResolved,
}

pub struct GitBridge {
    repo_root: PathBuf,
    journal_rel: String,
    /// Separate-branch mode target, from `git.branch`.
    sync_branch: Option<String>,
}

impl GitBridge {
    pub fn new(repo_root: &Path, journal_rel: &Path, sync_branch: Option<String>) -> Self {
        GitBridge {
            repo_root: repo_root.to_path_buf(),
            journal_rel: journal_rel.to_string_lossy().replace('\\', "/"),
            sync_branch,
        }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        let op = args.first().copied().unwrap_or("git").to_string();
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GitError::GitNotFound
                } else {
                    GitError::Io(e)
                }
            })?;

        let pid = child.id();
        let (tx, rx) = crossbeam::channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let output = match rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(_) => {
                kill_child(pid);
                // Collect the reaped child so no zombie lingers.
                let _ = rx.recv_timeout(Duration::from_secs(2));
                return Err(GitError::Timeout {
                    op,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn run_ok(&self, args: &[&str], timeout: Duration) -> Result<String, GitError> {
        let out = self.run(args, timeout)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(GitError::CommandFailed {
                op: args.join(" "),
                stderr: if out.stderr.is_empty() {
                    out.stdout
                } else {
                    out.stderr
                },
            })
        }
    }

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"], COMMIT_TIMEOUT)
            .map(|o| o.success)
            .unwrap_or(false)
    }

    pub fn require_repo(&self) -> Result<(), GitError> {
        if self.is_repo() {
            Ok(())
        } else {
            Err(GitError::NotARepo(self.repo_root.clone()))
        }
    }

    pub fn has_remote(&self) -> bool {
        self.run(&["remote"], COMMIT_TIMEOUT)
            .map(|o| o.success && !o.stdout.is_empty())
            .unwrap_or(false)
    }

    pub fn is_clean(&self) -> bool {
        self.run(&["status", "--porcelain"], COMMIT_TIMEOUT)
            .map(|o| o.success && o.stdout.is_empty())
            .unwrap_or(false)
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        self.run_ok(&["rev-parse", "--abbrev-ref", "HEAD"], COMMIT_TIMEOUT)
    }

    pub fn head_subjects(&self, limit: usize) -> Result<Vec<String>, GitError> {
        let out = self.run_ok(
            &["log", "--format=%s", "-n", &limit.to_string()],
            COMMIT_TIMEOUT,
        );
        match out {
            Ok(stdout) => Ok(stdout.lines().map(str::to_string).collect()),
            // An unborn branch has no log yet.
            Err(GitError::CommandFailed { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Stage the journal without committing (the pre-commit hook path:
    /// the in-flight commit picks the staged file up).
    pub fn stage(&self) -> Result<(), GitError> {
        self.run_ok(&["add", "--", &self.journal_rel], COMMIT_TIMEOUT)?;
        Ok(())
    }

    /// Stage and commit the journal. Returns the commit hash, or `None`
    /// when the journal had no staged changes.
    pub fn commit(&self, message: &str) -> Result<Option<String>, GitError> {
        if let Some(branch) = self.sync_branch.clone() {
            return self.commit_to_branch(&branch, message);
        }

        self.run_ok(&["add", "--", &self.journal_rel], COMMIT_TIMEOUT)?;
        let staged = self.run(
            &["diff", "--cached", "--quiet", "--", &self.journal_rel],
            COMMIT_TIMEOUT,
        )?;
        if staged.success {
            return Ok(None);
        }

        self.run_ok(
            &["commit", "-m", message, "--", &self.journal_rel],
            COMMIT_TIMEOUT,
        )?;
        let hash = self.run_ok(&["rev-parse", "HEAD"], COMMIT_TIMEOUT)?;
        Ok(Some(hash))
    }

    /// Separate-branch mode: commit the journal onto `branch` without
    /// touching the working tree, via hash-object/mktree/commit-tree.
    /// The sync branch carries only the journal.
    fn commit_to_branch(&self, branch: &str, message: &str) -> Result<Option<String>, GitError> {
        let journal_abs = self.repo_root.join(&self.journal_rel);
        let blob = self.run_ok(
            &["hash-object", "-w", "--", &journal_abs.to_string_lossy()],
            COMMIT_TIMEOUT,
        )?;

        let parent = self
            .run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")], COMMIT_TIMEOUT)?
            .stdout;
        let parent = if parent.is_empty() { None } else { Some(parent) };

        // Unchanged journal content means nothing to publish.
        if let Some(parent) = &parent {
            let existing = self.run(
                &["rev-parse", &format!("{parent}:{}", self.journal_rel)],
                COMMIT_TIMEOUT,
            )?;
            if existing.success && existing.stdout == blob {
                return Ok(None);
            }
        }

        // Nested tree: <root>/.beads dir entries first, then the root.
        let (dir, file) = match self.journal_rel.rsplit_once('/') {
            Some((dir, file)) => (Some(dir.to_string()), file.to_string()),
            None => (None, self.journal_rel.clone()),
        };
        let mut tree = self.mktree(&format!("100644 blob {blob}\t{file}\n"))?;
        if let Some(dir) = dir {
            // Right-to-left so `.beads/nested/dirs` would also fold up.
            for part in dir.rsplit('/') {
                tree = self.mktree(&format!("040000 tree {tree}\t{part}\n"))?;
            }
        }

        let mut args = vec!["commit-tree", &tree, "-m", message];
        if let Some(parent) = &parent {
            args.extend(["-p", parent]);
        }
        let commit = self.run_ok(&args, COMMIT_TIMEOUT)?;
        self.run_ok(
            &["update-ref", &format!("refs/heads/{branch}"), &commit],
            COMMIT_TIMEOUT,
        )?;
        Ok(Some(commit))
    }

    fn mktree(&self, listing: &str) -> Result<String, GitError> {
        use std::io::Write;

        let mut child = Command::new("git")
            .args(["mktree"])
            .current_dir(&self.repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(listing.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                op: "mktree".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Pull with rebase semantics. Journal-only conflicts are resolved
    /// in favor of the remote (the caller then re-imports + re-exports);
    /// anything else aborts the rebase and needs a human.
    pub fn pull(&self) -> Result<PullOutcome, GitError> {
        if !self.has_remote() {
            return Ok(PullOutcome::Clean);
        }
        if let Some(branch) = self.sync_branch.clone() {
            // Separate-branch mode has no working-tree merge at all; the
            // caller reads the fetched journal and merges through the store.
            let fetch = self.run(
                &["fetch", "origin", &format!("+{branch}:refs/remotes/origin/{branch}")],
                TRANSFER_TIMEOUT,
            )?;
            if !fetch.success && !fetch.stderr.contains("couldn't find remote ref") {
                return Err(GitError::CommandFailed {
                    op: "fetch".into(),
                    stderr: fetch.stderr,
                });
            }
            return Ok(PullOutcome::Clean);
        }

        let branch = self.current_branch()?;
        if branch == "HEAD" {
            // Detached head: nothing sensible to rebase onto.
            return Ok(PullOutcome::Clean);
        }
        let pull = self.run(
            &["pull", "--rebase", "--autostash", "origin", &branch],
            TRANSFER_TIMEOUT,
        )?;
        if pull.success {
            return Ok(PullOutcome::Clean);
        }

        let mut resolved_journal = false;
        // A rebase can stop once per replayed commit; resolve each stop.
        for _ in 0..32 {
            if !self.rebase_in_progress() {
                break;
            }
            let conflicted = self.conflicted_files()?;
            if conflicted.is_empty() {
                let cont = self.run(&["rebase", "--skip"], COMMIT_TIMEOUT)?;
                if !cont.success {
                    break;
                }
                continue;
            }
            if conflicted.iter().any(|f| f != &self.journal_rel) {
                let _ = self.run(&["rebase", "--abort"], COMMIT_TIMEOUT);
                return Err(GitError::ConflictNeedsHuman { files: conflicted });
            }

            // During a rebase, "ours" is the upstream (remote) side.
            self.run_ok(
                &["checkout", "--ours", "--", &self.journal_rel],
                COMMIT_TIMEOUT,
            )?;
            self.run_ok(&["add", "--", &self.journal_rel], COMMIT_TIMEOUT)?;
            let cont = Command::new("git")
                .args(["rebase", "--continue"])
                .current_dir(&self.repo_root)
                .env("GIT_EDITOR", "true")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()?;
            resolved_journal = true;
            if cont.status.success() && !self.rebase_in_progress() {
                break;
            }
        }

        if self.rebase_in_progress() {
            let _ = self.run(&["rebase", "--abort"], COMMIT_TIMEOUT);
            return Err(GitError::ConflictNeedsHuman {
                files: vec![self.journal_rel.clone()],
            });
        }
        if resolved_journal {
            Ok(PullOutcome::JournalResolved)
        } else {
            Err(GitError::CommandFailed {
                op: "pull --rebase".into(),
                stderr: pull.stderr,
            })
        }
    }

    fn rebase_in_progress(&self) -> bool {
        let git_dir = self
            .run(&["rev-parse", "--git-dir"], COMMIT_TIMEOUT)
            .map(|o| o.stdout)
            .unwrap_or_default();
        let git_dir = self.repo_root.join(git_dir);
        git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
    }

    fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_ok(&["diff", "--name-only", "--diff-filter=U"], COMMIT_TIMEOUT)?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Journal content on the remote side of the sync branch, if any.
    pub fn fetched_sync_journal(&self) -> Result<Option<String>, GitError> {
        let Some(branch) = &self.sync_branch else {
            return Ok(None);
        };
        let out = self.run(
            &["show", &format!("refs/remotes/origin/{branch}:{}", self.journal_rel)],
            COMMIT_TIMEOUT,
        )?;
        if out.success {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    /// Push; a non-fast-forward rejection triggers one pull-then-push
    /// retry before surfacing `PushFailed`.
    pub fn push(&self) -> Result<(), GitError> {
        if !self.has_remote() {
            return Ok(());
        }
        let refspec = match &self.sync_branch {
            Some(branch) => format!("{branch}:{branch}"),
            None => "HEAD".to_string(),
        };

        let first = self.run(&["push", "origin", &refspec], TRANSFER_TIMEOUT)?;
        if first.success {
            return Ok(());
        }
        if !is_non_fast_forward(&first.stderr) {
            return Err(GitError::CommandFailed {
                op: "push".into(),
                stderr: first.stderr,
            });
        }

        self.pull()?;
        let second = self.run(&["push", "origin", &refspec], TRANSFER_TIMEOUT)?;
        if second.success {
            Ok(())
        } else {
            Err(GitError::PushFailed {
                stderr: second.stderr,
            })
        }
    }
}

fn is_non_fast_forward(stderr: &str) -> bool {
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("[rejected]")
}

#[cfg(unix)]
fn kill_child(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_child(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, GitBridge) {
        let tmp = tempfile::tempdir().unwrap();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(tmp.path())
                .output()
                .unwrap();
            assert!(status.status.success(), "git {args:?}");
        }
        let bridge = GitBridge::new(tmp.path(), Path::new(".beads/issues.jsonl"), None);
        (tmp, bridge)
    }

    #[test]
    fn detects_repo() {
        let (tmp, bridge) = init_repo();
        assert!(bridge.is_repo());
        assert!(!bridge.has_remote());
        drop(tmp);

        let other = tempfile::tempdir().unwrap();
        let outside = GitBridge::new(other.path(), Path::new(".beads/issues.jsonl"), None);
        assert!(!outside.is_repo());
    }

    #[test]
    fn commit_skips_when_unchanged() {
        let (tmp, bridge) = init_repo();
        std::fs::create_dir_all(tmp.path().join(".beads")).unwrap();
        std::fs::write(tmp.path().join(".beads/issues.jsonl"), "{}\n").unwrap();

        let first = bridge.commit("beads: test").unwrap();
        assert!(first.is_some());
        let second = bridge.commit("beads: test").unwrap();
        assert_eq!(second, None);
    }

    #[test]
    fn commit_only_touches_the_journal() {
        let (tmp, bridge) = init_repo();
        std::fs::create_dir_all(tmp.path().join(".beads")).unwrap();
        std::fs::write(tmp.path().join(".beads/issues.jsonl"), "{}\n").unwrap();
        std::fs::write(tmp.path().join("unrelated.txt"), "dirty").unwrap();

        bridge.commit("beads: journal").unwrap();
        // The unrelated file stays uncommitted.
        assert!(!bridge.is_clean());
        let subjects = bridge.head_subjects(10).unwrap();
        assert_eq!(subjects, vec!["beads: journal".to_string()]);
    }

    #[test]
    fn separate_branch_commit_leaves_worktree_alone() {
        let (tmp, _) = init_repo();
        std::fs::create_dir_all(tmp.path().join(".beads")).unwrap();
        std::fs::write(tmp.path().join(".beads/issues.jsonl"), "{\"a\":1}\n").unwrap();

        let bridge = GitBridge::new(
            tmp.path(),
            Path::new(".beads/issues.jsonl"),
            Some("beads-sync".into()),
        );
        let first = bridge.commit("beads: sync").unwrap();
        assert!(first.is_some());
        // Same content: no new commit.
        assert_eq!(bridge.commit("beads: sync").unwrap(), None);

        // The branch exists and carries the journal.
        let shown = bridge
            .run_ok(&["show", "beads-sync:.beads/issues.jsonl"], COMMIT_TIMEOUT)
            .unwrap();
        assert_eq!(shown, "{\"a\":1}");
        // HEAD of the working branch never moved.
        let head = bridge.run(&["rev-parse", "--verify", "--quiet", "HEAD"], COMMIT_TIMEOUT).unwrap();
        assert!(head.stdout.is_empty(), "worktree branch should stay unborn");
    }

    #[test]
    fn pull_without_remote_is_a_noop() {
        let (_tmp, bridge) = init_repo();
        assert_eq!(bridge.pull().unwrap(), PullOutcome::Clean);
    }
}
