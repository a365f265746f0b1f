//! Journal record codec.
//!
//! One JSON object per line, one line per issue. Field order is fixed by
//! struct declaration and `None` options are omitted, so two stores with
//! identical logical state encode byte-identical lines. The `schema`
//! field gates forward compatibility: records from a future schema abort
//! the import instead of being silently misread.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{DepEdge, Issue, IssueId, IssueType, Priority, Status, Timestamp};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    #[error(
        "record on line {line} uses journal schema {found}, but this binary supports up to \
         {SCHEMA_VERSION}; upgrade beads to import this journal"
    )]
    SchemaMismatch { line: usize, found: u32 },
}

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

/// Wire form of one issue snapshot. Keep the field order stable: it is
/// the journal's canonical order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    #[serde(default = "default_schema")]
    pub schema: u32,
    pub id: IssueId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub acceptance_criteria: String,
    pub status: Status,
    pub priority: Priority,
    pub issue_type: IssueType,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DepEdge>,
}

impl From<&Issue> for JournalRecord {
    fn from(issue: &Issue) -> Self {
        let mut issue = issue.clone();
        issue.sort_deps();
        JournalRecord {
            schema: SCHEMA_VERSION,
            id: issue.id,
            title: issue.title,
            description: issue.description,
            design: issue.design,
            acceptance_criteria: issue.acceptance_criteria,
            status: issue.status,
            priority: issue.priority,
            issue_type: issue.issue_type,
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            closed_at: issue.closed_at,
            close_reason: issue.close_reason,
            external_ref: issue.external_ref,
            dependencies: issue.deps,
        }
    }
}

impl From<JournalRecord> for Issue {
    fn from(record: JournalRecord) -> Self {
        let mut issue = Issue {
            id: record.id,
            title: record.title,
            description: record.description,
            design: record.design,
            acceptance_criteria: record.acceptance_criteria,
            status: record.status,
            priority: record.priority,
            issue_type: record.issue_type,
            created_at: record.created_at,
            updated_at: record.updated_at,
            closed_at: record.closed_at,
            close_reason: record.close_reason,
            external_ref: record.external_ref,
            deps: record.dependencies,
        };
        issue.sort_deps();
        issue
    }
}

/// Canonical single-line encoding, no trailing newline.
pub fn encode_line(issue: &Issue) -> String {
    serde_json::to_string(&JournalRecord::from(issue))
        .expect("journal records always serialize")
}

pub fn decode_line(line: &str, line_no: usize) -> Result<Issue, CodecError> {
    // Peek at the schema before strict decoding so that a future record
    // produces guidance rather than a field error.
    let probe: SchemaProbe =
        serde_json::from_str(line).map_err(|e| CodecError::MalformedRecord {
            line: line_no,
            reason: e.to_string(),
        })?;
    if probe.schema > SCHEMA_VERSION {
        return Err(CodecError::SchemaMismatch {
            line: line_no,
            found: probe.schema,
        });
    }

    let record: JournalRecord =
        serde_json::from_str(line).map_err(|e| CodecError::MalformedRecord {
            line: line_no,
            reason: e.to_string(),
        })?;
    Ok(Issue::from(record))
}

#[derive(Deserialize)]
struct SchemaProbe {
    #[serde(default = "default_schema")]
    schema: u32,
}

/// Last-writer-wins comparison: does `candidate` supersede `incumbent`?
///
/// Ties on `updated_at` break deterministically: closed beats non-closed
/// (closure stays monotonic), then the greater canonical encoding wins.
/// Symmetric on both sides of a merge, so siblings converge.
pub fn supersedes(candidate: &Issue, incumbent: &Issue) -> bool {
    if candidate.updated_at != incumbent.updated_at {
        return candidate.updated_at > incumbent.updated_at;
    }
    let (cr, ir) = (
        candidate.status.merge_rank(),
        incumbent.status.merge_rank(),
    );
    if cr != ir {
        return cr > ir;
    }
    encode_line(candidate) > encode_line(incumbent)
}

/// Decoded journal content: records collapsed by id (latest wins) plus
/// per-line decode failures.
#[derive(Debug, Default)]
pub struct DecodedJournal {
    pub issues: Vec<Issue>,
    pub malformed: Vec<CodecError>,
}

/// Decode a whole journal. Malformed lines are collected and skipped;
/// a schema mismatch aborts the decode.
pub fn decode_journal(content: &str) -> Result<DecodedJournal, CodecError> {
    let mut by_id: Vec<Issue> = Vec::new();
    let mut malformed = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line, idx + 1) {
            Ok(issue) => {
                match by_id.iter_mut().find(|existing| existing.id == issue.id) {
                    Some(existing) => {
                        if supersedes(&issue, existing) {
                            *existing = issue;
                        }
                    }
                    None => by_id.push(issue),
                }
            }
            Err(err @ CodecError::SchemaMismatch { .. }) => return Err(err),
            Err(err) => malformed.push(err),
        }
    }

    Ok(DecodedJournal {
        issues: by_id,
        malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DepKind;

    fn sample(id: &str) -> Issue {
        let mut issue = Issue::new(
            IssueId::parse(id).unwrap(),
            "Sample".into(),
            Priority::DEFAULT,
            IssueType::Task,
        );
        issue.created_at = Timestamp::from_millis(1_000);
        issue.updated_at = Timestamp::from_millis(1_000);
        issue
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut issue = sample("bd-a1b2c3d");
        issue.deps.push(DepEdge {
            to: IssueId::parse("bd-f00ba42").unwrap(),
            kind: DepKind::Blocks,
        });
        let line = encode_line(&issue);
        let decoded = decode_line(&line, 1).unwrap();
        assert_eq!(decoded, issue);
        // Determinism: re-encoding is byte-identical.
        assert_eq!(encode_line(&decoded), line);
    }

    #[test]
    fn schema_field_leads_the_line() {
        let line = encode_line(&sample("bd-a1b2c3d"));
        assert!(line.starts_with("{\"schema\":1,\"id\":\"bd-a1b2c3d\""), "{line}");
    }

    #[test]
    fn future_schema_is_rejected_with_guidance() {
        let line = r#"{"schema":99,"id":"bd-a1b2c3d","title":"x"}"#;
        match decode_line(line, 7) {
            Err(CodecError::SchemaMismatch { line: 7, found: 99 }) => {}
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_reported_not_fatal() {
        let good = encode_line(&sample("bd-a1b2c3d"));
        let content = format!("{good}\nnot json\n{}\n", encode_line(&sample("bd-b2c3d4e")));
        let decoded = decode_journal(&content).unwrap();
        assert_eq!(decoded.issues.len(), 2);
        assert_eq!(decoded.malformed.len(), 1);
    }

    #[test]
    fn duplicate_ids_collapse_to_latest() {
        let mut older = sample("bd-a1b2c3d");
        older.title = "old title".into();
        let mut newer = older.clone();
        newer.title = "new title".into();
        newer.updated_at = Timestamp::from_millis(2_000);

        let content = format!("{}\n{}\n", encode_line(&newer), encode_line(&older));
        let decoded = decode_journal(&content).unwrap();
        assert_eq!(decoded.issues.len(), 1);
        assert_eq!(decoded.issues[0].title, "new title");
    }

    #[test]
    fn equal_timestamp_tie_prefers_closed() {
        let open = sample("bd-a1b2c3d");
        let mut closed = open.clone();
        closed.status = Status::Closed;
        closed.closed_at = Some(closed.updated_at);

        assert!(supersedes(&closed, &open));
        assert!(!supersedes(&open, &closed));
    }

    #[test]
    fn equal_timestamp_equal_status_tie_is_deterministic() {
        let a = sample("bd-a1b2c3d");
        let mut b = a.clone();
        b.title = "Zother".into();

        // Exactly one direction wins, both sides agree.
        assert_ne!(supersedes(&a, &b), supersedes(&b, &a));
    }
}
