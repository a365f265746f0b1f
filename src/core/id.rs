//! Issue identifiers.
//!
//! `<prefix>-<suffix>` where the suffix is the first 7 hex characters of
//! SHA-256 over (creation millis, title, random salt). Content-derived
//! suffixes make concurrently created issues in sibling workspaces
//! collision-free with overwhelming probability, which keeps journal
//! merges clean.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::time::Timestamp;

pub const SUFFIX_LEN: usize = 7;

#[derive(Debug, Error)]
#[error("invalid issue id {0:?}: expected <prefix>-<alphanumeric suffix>")]
pub struct InvalidIssueId(pub String);

/// A validated issue identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    /// Validate and wrap an identifier string.
    pub fn parse(s: &str) -> Result<Self, InvalidIssueId> {
        let Some(dash) = s.rfind('-') else {
            return Err(InvalidIssueId(s.to_string()));
        };
        let (prefix, suffix) = (&s[..dash], &s[dash + 1..]);
        if prefix.is_empty()
            || suffix.is_empty()
            || suffix.len() > 16
            || !suffix.chars().all(|c| c.is_ascii_alphanumeric())
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidIssueId(s.to_string()));
        }
        Ok(IssueId(s.to_string()))
    }

    /// Derive a fresh identifier. Callers retry with a new call on the
    /// (vanishingly rare) collision with an existing id.
    pub fn generate(prefix: &str, created_at: Timestamp, title: &str) -> Self {
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(created_at.as_millis().to_be_bytes());
        hasher.update(title.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();

        let mut suffix = String::with_capacity(SUFFIX_LEN);
        for byte in digest.iter() {
            use std::fmt::Write;
            write!(suffix, "{:02x}", byte).expect("writing to String");
            if suffix.len() >= SUFFIX_LEN {
                break;
            }
        }
        suffix.truncate(SUFFIX_LEN);

        IssueId(format!("{prefix}-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix(&self) -> &str {
        let dash = self.0.rfind('-').expect("validated id contains a dash");
        &self.0[..dash]
    }

    /// Scan free text (e.g. commit subjects) for ids with the given
    /// prefix. Used by orphan detection.
    pub fn scan(text: &str, prefix: &str) -> Vec<IssueId> {
        let needle = format!("{prefix}-");
        let mut found = Vec::new();
        let mut rest = text;
        while let Some(pos) = rest.find(&needle) {
            // Reject matches that continue a larger word, e.g. "xbd-12".
            let boundary_ok = pos == 0
                || !rest[..pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            let after = &rest[pos + needle.len()..];
            let suffix: String = after
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if boundary_ok && !suffix.is_empty() {
                if let Ok(id) = IssueId::parse(&format!("{prefix}-{suffix}")) {
                    if !found.contains(&id) {
                        found.push(id);
                    }
                }
            }
            rest = &rest[pos + needle.len()..];
        }
        found
    }
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IssueId {
    type Error = InvalidIssueId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        IssueId::parse(&s)
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> String {
        id.0
    }
}

impl std::str::FromStr for IssueId {
    type Err = InvalidIssueId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IssueId::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_has_prefix_and_hex_suffix() {
        let id = IssueId::generate("bd", Timestamp::from_millis(1_000), "fix the thing");
        assert_eq!(id.prefix(), "bd");
        let suffix = &id.as_str()[3..];
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_is_salted() {
        let a = IssueId::generate("bd", Timestamp::from_millis(1_000), "same title");
        let b = IssueId::generate("bd", Timestamp::from_millis(1_000), "same title");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(IssueId::parse("nodash").is_err());
        assert!(IssueId::parse("bd-").is_err());
        assert!(IssueId::parse("-abc").is_err());
        assert!(IssueId::parse("bd-abc!").is_err());
        assert!(IssueId::parse("bd-a1b2c3d").is_ok());
        assert!(IssueId::parse("my_proj-42").is_ok());
    }

    #[test]
    fn scan_finds_ids_in_commit_subjects() {
        let ids = IssueId::scan("Fix thing (bd-42) and bd-a1b2c3d, not xbd-9", "bd");
        let strs: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
        assert_eq!(strs, vec!["bd-42", "bd-a1b2c3d"]);
    }

    #[test]
    fn scan_dedups() {
        let ids = IssueId::scan("bd-42 bd-42", "bd");
        assert_eq!(ids.len(), 1);
    }
}
