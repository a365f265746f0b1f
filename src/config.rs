//! Per-database configuration.
//!
//! Settings live in the store's `config` table as key/value pairs and are
//! loaded into a typed snapshot at startup. Unknown keys round-trip
//! untouched so newer versions can add settings without breaking older
//! binaries.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

pub const KEY_ISSUE_PREFIX: &str = "issue.prefix";
pub const KEY_ROUTING_MODE: &str = "routing.mode";
pub const KEY_ROUTING_PLANNING_DB: &str = "routing.planning_db";
pub const KEY_DAEMON_MODE: &str = "daemon.mode";
pub const KEY_DAEMON_DEBOUNCE_MS: &str = "daemon.debounce_ms";
pub const KEY_DAEMON_POLL_MS: &str = "daemon.poll_interval_ms";
pub const KEY_GIT_AUTO_COMMIT: &str = "git.auto_commit";
pub const KEY_GIT_AUTO_PUSH: &str = "git.auto_push";
pub const KEY_GIT_AUTO_PULL: &str = "git.auto_pull";
pub const KEY_GIT_BRANCH: &str = "git.branch";

pub const DEFAULT_PREFIX: &str = "bd";
pub const DEFAULT_EXPORT_DEBOUNCE: Duration = Duration::from_secs(30);
pub const IMPORT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

/// Whether new issues route to a central planning database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    Auto,
    #[default]
    Explicit,
}

/// How the daemon observes external journal changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DaemonMode {
    #[default]
    Events,
    Poll,
}

/// Typed snapshot of the config table.
#[derive(Debug, Clone)]
pub struct Config {
    pub issue_prefix: String,
    pub routing_mode: RoutingMode,
    pub planning_db: Option<String>,
    pub daemon_mode: DaemonMode,
    pub export_debounce: Duration,
    pub poll_interval: Duration,
    pub git_auto_commit: bool,
    pub git_auto_push: bool,
    pub git_auto_pull: bool,
    pub git_branch: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            issue_prefix: DEFAULT_PREFIX.to_string(),
            routing_mode: RoutingMode::default(),
            planning_db: None,
            daemon_mode: DaemonMode::default(),
            export_debounce: DEFAULT_EXPORT_DEBOUNCE,
            poll_interval: POLL_INTERVAL,
            git_auto_commit: true,
            git_auto_push: false,
            git_auto_pull: false,
            git_branch: None,
        }
    }
}

impl Config {
    /// Build from raw key/value pairs; unknown keys are ignored here but
    /// preserved by the store.
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for (key, value) in pairs {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    /// Validate and apply one setting.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            KEY_ISSUE_PREFIX => self.issue_prefix = value.to_string(),
            KEY_ROUTING_MODE => {
                self.routing_mode = match value {
                    "auto" => RoutingMode::Auto,
                    "explicit" => RoutingMode::Explicit,
                    _ => return Err(invalid(key, value, "auto or explicit")),
                }
            }
            KEY_ROUTING_PLANNING_DB => self.planning_db = non_empty(value),
            KEY_DAEMON_MODE => {
                self.daemon_mode = match value {
                    "events" => DaemonMode::Events,
                    "poll" => DaemonMode::Poll,
                    _ => return Err(invalid(key, value, "events or poll")),
                }
            }
            KEY_DAEMON_DEBOUNCE_MS => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| invalid(key, value, "a duration in milliseconds"))?;
                self.export_debounce = Duration::from_millis(ms);
            }
            KEY_DAEMON_POLL_MS => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| invalid(key, value, "a duration in milliseconds"))?;
                self.poll_interval = Duration::from_millis(ms);
            }
            KEY_GIT_AUTO_COMMIT => self.git_auto_commit = parse_bool(key, value)?,
            KEY_GIT_AUTO_PUSH => self.git_auto_push = parse_bool(key, value)?,
            KEY_GIT_AUTO_PULL => self.git_auto_pull = parse_bool(key, value)?,
            KEY_GIT_BRANCH => self.git_branch = non_empty(value),
            _ => {}
        }
        Ok(())
    }

    /// The daemon mode after the env override is applied.
    pub fn effective_daemon_mode(&self) -> DaemonMode {
        match std::env::var(crate::paths::DAEMON_MODE_ENV).as_deref() {
            Ok("poll") => DaemonMode::Poll,
            Ok("events") => DaemonMode::Events,
            _ => self.daemon_mode,
        }
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value, "true or false")),
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
