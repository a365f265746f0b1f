//! Domain types shared by every subsystem.

pub mod id;
pub mod issue;
pub mod time;

pub use id::{InvalidIssueId, IssueId};
pub use issue::{DepEdge, DepKind, Issue, IssueType, ParseDomainError, Priority, Status};
pub use time::Timestamp;
