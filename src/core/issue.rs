//! The issue domain model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::id::IssueId;
use super::time::Timestamp;

#[derive(Debug, Error)]
#[error("invalid {what}: {input:?} (valid: {valid})")]
pub struct ParseDomainError {
    pub what: &'static str,
    pub input: String,
    pub valid: &'static str,
}

/// Issue workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Closed => "closed",
        }
    }

    /// Rank for merge tie-breaks: closed sorts above every live status.
    pub(crate) fn merge_rank(self) -> u8 {
        match self {
            Status::Open => 0,
            Status::InProgress => 1,
            Status::Blocked => 2,
            Status::Closed => 3,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Status::Open),
            "in_progress" => Ok(Status::InProgress),
            "blocked" => Ok(Status::Blocked),
            "closed" => Ok(Status::Closed),
            _ => Err(ParseDomainError {
                what: "status",
                input: s.to_string(),
                valid: "open, in_progress, blocked, closed",
            }),
        }
    }
}

/// Issue kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Bug,
    Task,
    Feature,
    Epic,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Task => "task",
            IssueType::Feature => "feature",
            IssueType::Epic => "epic",
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueType {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bug" => Ok(IssueType::Bug),
            "task" => Ok(IssueType::Task),
            "feature" => Ok(IssueType::Feature),
            "epic" => Ok(IssueType::Epic),
            _ => Err(ParseDomainError {
                what: "issue type",
                input: s.to_string(),
                valid: "bug, task, feature, epic",
            }),
        }
    }
}

/// Priority 0..=3, 0 highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(2);

    pub fn new(value: u8) -> Result<Self, ParseDomainError> {
        if value <= 3 {
            Ok(Priority(value))
        } else {
            Err(ParseDomainError {
                what: "priority",
                input: value.to_string(),
                valid: "0 through 3",
            })
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseDomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Priority {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s.parse().map_err(|_| ParseDomainError {
            what: "priority",
            input: s.to_string(),
            valid: "0 through 3",
        })?;
        Priority::new(value)
    }
}

/// Dependency edge kind. Only `blocks` participates in cycle rejection
/// and readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepKind {
    Blocks,
    ParentOf,
    RelatedTo,
}

impl DepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DepKind::Blocks => "blocks",
            DepKind::ParentOf => "parent-of",
            DepKind::RelatedTo => "related-to",
        }
    }
}

impl std::fmt::Display for DepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DepKind {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(DepKind::Blocks),
            "parent-of" => Ok(DepKind::ParentOf),
            "related-to" => Ok(DepKind::RelatedTo),
            _ => Err(ParseDomainError {
                what: "dependency kind",
                input: s.to_string(),
                valid: "blocks, parent-of, related-to",
            }),
        }
    }
}

/// Directed dependency edge, stored on the from-issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepEdge {
    pub to: IssueId,
    pub kind: DepKind,
}

/// The primary entity. `updated_at` is monotonic per issue and is the
/// last-writer-wins key across workspaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub description: String,
    pub design: String,
    pub acceptance_criteria: String,
    pub status: Status,
    pub priority: Priority,
    pub issue_type: IssueType,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub close_reason: Option<String>,
    pub external_ref: Option<String>,
    pub deps: Vec<DepEdge>,
}

impl Issue {
    pub fn new(id: IssueId, title: String, priority: Priority, issue_type: IssueType) -> Self {
        let now = Timestamp::now();
        Issue {
            id,
            title,
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            status: Status::Open,
            priority,
            issue_type,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            external_ref: None,
            deps: Vec::new(),
        }
    }

    pub fn blocking_deps(&self) -> impl Iterator<Item = &IssueId> {
        self.deps
            .iter()
            .filter(|d| d.kind == DepKind::Blocks)
            .map(|d| &d.to)
    }

    /// Sort edges into canonical (kind, target) order.
    pub fn sort_deps(&mut self) {
        self.deps
            .sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.to.cmp(&b.to)));
    }
}
