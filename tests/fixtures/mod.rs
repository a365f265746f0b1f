//! Shared test fixtures: throwaway repos with a beads database, plus a
//! configured `bd` command builder.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use assert_cmd::Command;
use tempfile::TempDir;

pub struct TestRepo {
    _tmp: TempDir,
    pub root: PathBuf,
}

impl TestRepo {
    /// A plain directory, no git, no database.
    pub fn bare_dir() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().to_path_buf();
        TestRepo { _tmp: tmp, root }
    }

    /// Initialized git repo with user config, no database yet.
    pub fn git() -> Self {
        let repo = Self::bare_dir();
        repo.git_run(&["init", "-q", "-b", "main"]);
        repo.git_run(&["config", "user.email", "test@example.com"]);
        repo.git_run(&["config", "user.name", "Test User"]);
        repo
    }

    /// Git repo with a `bd init`-ed database (prefix `bd`).
    pub fn with_db() -> Self {
        let repo = Self::git();
        repo.bd(&["init", "--prefix", "bd"]).assert().success();
        repo
    }

    /// A `bd` invocation rooted in this repo with a clean environment.
    pub fn bd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("bd").expect("bd binary");
        cmd.current_dir(&self.root)
            .env_remove("BEADS_DIR")
            .env_remove("BEADS_DB")
            .env_remove("BEADS_DAEMON_MODE")
            .env("BEADS_LOG", "error")
            .args(args);
        cmd
    }

    pub fn git_run(&self, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub fn git_commit_all(&self, message: &str) {
        self.git_run(&["add", "-A"]);
        self.git_run(&["commit", "-q", "-m", message]);
    }

    pub fn journal(&self) -> PathBuf {
        self.root.join(".beads/issues.jsonl")
    }

    pub fn read_journal(&self) -> String {
        std::fs::read_to_string(self.journal()).unwrap_or_default()
    }

    /// Extract the created issue id from `bd create --json` output.
    pub fn create_issue(&self, title: &str) -> String {
        let output = self
            .bd(&["--json", "create", title])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let value: serde_json::Value = serde_json::from_slice(&output).expect("json output");
        value["id"].as_str().expect("id field").to_string()
    }
}

/// Wire `a` and `b` to a shared bare "origin" so pushes and pulls flow
/// between them.
pub fn link_remotes(a: &TestRepo, b: &TestRepo) -> TempDir {
    let origin = TempDir::new().expect("tempdir");
    let output = StdCommand::new("git")
        .args(["init", "-q", "--bare", "-b", "main"])
        .current_dir(origin.path())
        .output()
        .expect("git init --bare");
    assert!(output.status.success());

    let url = origin.path().to_string_lossy().to_string();
    a.git_run(&["remote", "add", "origin", &url]);
    b.git_run(&["remote", "add", "origin", &url]);
    origin
}

pub fn wait_until(timeout: std::time::Duration, what: &str, cond: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(25));
    }
    panic!("timeout waiting for {what}");
}

#[allow(dead_code)]
pub fn touch(path: &Path) {
    std::fs::write(path, b"x").expect("touch");
}
