//! The `bd` command surface.
//!
//! Thin dispatch onto `api::Workspace`; every verb supports `--json`
//! for machine-readable output.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::api::{parse_dep_spec, SyncNowAction, Workspace};
use crate::core::{DepKind, Issue, IssueId, IssueType, Priority, Status};
use crate::error::{exit, Error, Result};
use crate::store::{IssuePatch, ListFilter, NewIssue, StoreBackend};

#[derive(Parser, Debug)]
#[command(name = "bd", version, about = "Git-native issue tracking")]
pub struct Cli {
    /// Emit machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Hook sentinel: perform one synchronous action and exit.
    #[arg(long, value_enum, value_name = "ACTION", hide = true)]
    pub sync_now: Option<SyncNowAction>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new beads database in the current directory.
    Init {
        /// Issue id prefix (defaults to a name derived from the directory).
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Create an issue.
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        design: String,
        #[arg(long, default_value = "")]
        acceptance: String,
        #[arg(short, long)]
        priority: Option<Priority>,
        #[arg(short = 't', long = "type")]
        issue_type: Option<IssueType>,
        #[arg(long)]
        external_ref: Option<String>,
        /// Dependency as `<id>` or `<id>:<kind>`; repeatable.
        #[arg(long = "dep")]
        deps: Vec<String>,
    },
    /// Update fields on an issue.
    Update {
        id: IssueId,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        design: Option<String>,
        #[arg(long)]
        acceptance: Option<String>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(short, long)]
        priority: Option<Priority>,
        #[arg(short = 't', long = "type")]
        issue_type: Option<IssueType>,
        #[arg(long)]
        external_ref: Option<String>,
    },
    /// Close an issue (soft: the record stays in the journal).
    Close {
        id: IssueId,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Reopen a closed issue.
    Reopen { id: IssueId },
    /// List issues.
    List {
        #[arg(long)]
        status: Option<Status>,
        #[arg(short = 't', long = "type")]
        issue_type: Option<IssueType>,
        #[arg(short, long)]
        priority: Option<Priority>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show one issue in full.
    Show { id: IssueId },
    /// Open issues whose blockers are all closed.
    Ready,
    /// Issue counts by status.
    Stats,
    /// Manage dependency edges.
    Dep {
        #[command(subcommand)]
        command: DepCommand,
    },
    /// Merge a journal file into the store.
    Import {
        /// Journal file (defaults to the database's own journal).
        file: Option<PathBuf>,
    },
    /// Write the store out to the journal file.
    Export,
    /// Flush, commit, pull, import, and push in one synchronous pass.
    Sync,
    /// Integrity and orphan checks.
    Doctor,
    /// Git hook management.
    Hooks {
        #[command(subcommand)]
        command: HooksCommand,
    },
    /// Run the daemon in the foreground.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Inspect or stop daemons attached to this database.
    Daemons {
        #[command(subcommand)]
        command: DaemonsCommand,
    },
    /// Read or write per-database settings.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum DepCommand {
    /// Add an edge (rejects blocks-cycles).
    Add {
        from: IssueId,
        to: IssueId,
        #[arg(long, default_value = "blocks")]
        kind: DepKind,
    },
    /// Remove an edge.
    Remove {
        from: IssueId,
        to: IssueId,
        #[arg(long, default_value = "blocks")]
        kind: DepKind,
    },
}

#[derive(Subcommand, Debug)]
pub enum HooksCommand {
    /// Install the managed pre-commit/post-merge/pre-push/post-checkout hooks.
    Install,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the supervisor until signalled.
    Run,
}

#[derive(Subcommand, Debug)]
pub enum DaemonsCommand {
    List,
    Health,
    Killall,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    List,
    Get { key: String },
    Set { key: String, value: String },
}

/// Dispatch a parsed invocation. Returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    let json = cli.json;

    // Hooks call `bd --sync-now <action>`: do the one thing and leave.
    if let Some(action) = cli.sync_now {
        let workspace = Workspace::open_current()?;
        workspace.sync_now(action)?;
        return Ok(exit::OK);
    }

    let Some(command) = cli.command else {
        return Err(Error::usage("no command given; try `bd --help`"));
    };

    match command {
        Command::Init { prefix } => {
            let cwd = std::env::current_dir()
                .map_err(|e| Error::usage(format!("cannot resolve working directory: {e}")))?;
            let workspace = Workspace::init(&cwd, prefix)?;
            let prefix = workspace.config()?.issue_prefix;
            if json {
                print_json(&serde_json::json!({
                    "db": workspace.paths().db(),
                    "prefix": prefix,
                }));
            } else {
                println!(
                    "initialized beads database at {} (prefix {prefix})",
                    workspace.paths().base().display()
                );
            }
        }
        Command::Create {
            title,
            description,
            design,
            acceptance,
            priority,
            issue_type,
            external_ref,
            deps,
        } => {
            let deps = deps
                .iter()
                .map(|spec| parse_dep_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            let workspace = Workspace::open_current()?;
            let issue = workspace.create(NewIssue {
                title,
                description,
                design,
                acceptance_criteria: acceptance,
                priority,
                issue_type,
                external_ref,
                deps,
            })?;
            if json {
                print_json(&issue);
            } else {
                println!("created {}", issue.id);
            }
        }
        Command::Update {
            id,
            title,
            description,
            design,
            acceptance,
            status,
            priority,
            issue_type,
            external_ref,
        } => {
            let patch = IssuePatch {
                title,
                description,
                design,
                acceptance_criteria: acceptance,
                status,
                priority,
                issue_type,
                external_ref: external_ref.map(Some),
                expected_updated_at: None,
            };
            if patch.is_empty() {
                return Err(Error::usage("nothing to update; pass at least one field"));
            }
            let workspace = Workspace::open_current()?;
            let issue = workspace.store().update(&id, patch)?;
            if json {
                print_json(&issue);
            } else {
                println!("updated {}", issue.id);
            }
        }
        Command::Close { id, reason } => {
            let workspace = Workspace::open_current()?;
            let issue = workspace.store().close(&id, reason)?;
            if json {
                print_json(&issue);
            } else {
                println!("closed {}", issue.id);
            }
        }
        Command::Reopen { id } => {
            let workspace = Workspace::open_current()?;
            let issue = workspace.store().reopen(&id)?;
            if json {
                print_json(&issue);
            } else {
                println!("reopened {}", issue.id);
            }
        }
        Command::List {
            status,
            issue_type,
            priority,
            limit,
        } => {
            let workspace = Workspace::open_current()?;
            let issues = workspace.store().list(&ListFilter {
                status,
                issue_type,
                priority,
                limit,
            })?;
            if json {
                print_json(&issues);
            } else {
                for issue in &issues {
                    println!("{}", summary_line(issue));
                }
            }
        }
        Command::Show { id } => {
            let workspace = Workspace::open_current()?;
            let issue = workspace.store().show(&id)?;
            if json {
                print_json(&issue);
            } else {
                print_full(&issue);
            }
        }
        Command::Ready => {
            let workspace = Workspace::open_current()?;
            let issues = workspace.store().ready()?;
            if json {
                print_json(&issues);
            } else {
                for issue in &issues {
                    println!("{}", summary_line(issue));
                }
            }
        }
        Command::Stats => {
            let workspace = Workspace::open_current()?;
            let stats = workspace.store().stats()?;
            if json {
                print_json(&stats);
            } else {
                println!(
                    "total {}  open {}  in_progress {}  blocked {}  closed {}  ready {}",
                    stats.total,
                    stats.open,
                    stats.in_progress,
                    stats.blocked,
                    stats.closed,
                    stats.ready
                );
            }
        }
        Command::Dep { command } => {
            let workspace = Workspace::open_current()?;
            match command {
                DepCommand::Add { from, to, kind } => {
                    workspace.store().add_dep(&from, &to, kind)?;
                    if json {
                        print_json(&serde_json::json!({"from": from, "to": to, "kind": kind}));
                    } else {
                        println!("{from} {kind} {to}");
                    }
                }
                DepCommand::Remove { from, to, kind } => {
                    workspace.store().remove_dep(&from, &to, kind)?;
                    if !json {
                        println!("removed {from} {kind} {to}");
                    }
                }
            }
        }
        Command::Import { file } => {
            let workspace = Workspace::open_current()?;
            let report = workspace.import(file.as_deref())?;
            if json {
                print_json(&report);
            } else {
                println!(
                    "imported: {} new, {} updated, {} stale ignored, {} malformed, \
                     {} dangling, {} cycle-rejected",
                    report.inserted,
                    report.updated,
                    report.ignored_stale,
                    report.malformed.len(),
                    report.dangling.len(),
                    report.cycles.len()
                );
            }
        }
        Command::Export => {
            let workspace = Workspace::open_current()?;
            let outcome = workspace.export()?;
            if json {
                print_json(&serde_json::json!({
                    "written": outcome.written,
                    "records": outcome.records,
                }));
            } else if outcome.written {
                println!("exported {} records", outcome.records);
            } else {
                println!("journal already up to date ({} records)", outcome.records);
            }
        }
        Command::Sync => {
            let workspace = Workspace::open_current()?;
            let summary = workspace.sync()?;
            if json {
                print_json(&summary);
            } else {
                println!(
                    "sync: exported={} imported={} pushed={}{}",
                    summary.exported,
                    summary.imported,
                    summary.pushed,
                    if summary.resolved_conflict {
                        " (journal conflict auto-resolved)"
                    } else {
                        ""
                    }
                );
            }
        }
        Command::Doctor => {
            let workspace = Workspace::open_current()?;
            let report = workspace.doctor()?;
            if json {
                print_json(&report);
            } else {
                for check in &report.checks {
                    let mark = if check.ok { "ok  " } else { "FAIL" };
                    println!("{mark} {}: {}", check.name, check.detail);
                }
            }
            if !report.healthy() {
                return Ok(exit::USER);
            }
        }
        Command::Hooks { command } => match command {
            HooksCommand::Install => {
                let workspace = Workspace::open_current()?;
                let reports = workspace.install_hooks()?;
                if json {
                    print_json(&reports);
                } else {
                    for report in &reports {
                        println!("{}: {:?}", report.hook, report.outcome);
                    }
                }
            }
        },
        Command::Daemon { command } => match command {
            DaemonCommand::Run => {
                let workspace = Workspace::open_current()?;
                let paths = workspace.paths().clone();
                drop(workspace);
                crate::daemon::run_daemon(paths)?;
            }
        },
        Command::Daemons { command } => {
            let workspace = Workspace::open_current()?;
            match command {
                DaemonsCommand::List | DaemonsCommand::Health => {
                    let daemons = workspace.daemons_list()?;
                    if json {
                        print_json(&daemons);
                    } else if daemons.is_empty() {
                        println!("no daemon attached to {}", workspace.paths().db().display());
                    } else {
                        for status in &daemons {
                            println!(
                                "pid {} {} (db {})",
                                status.meta.pid,
                                if status.alive { "alive" } else { "dead" },
                                status.db.display()
                            );
                        }
                    }
                }
                DaemonsCommand::Killall => {
                    let killed = workspace.daemons_killall()?;
                    if json {
                        print_json(&serde_json::json!({"killed": killed}));
                    } else {
                        println!("signalled {killed} daemon(s)");
                    }
                }
            }
        }
        Command::Config { command } => {
            let workspace = Workspace::open_current()?;
            match command {
                ConfigCommand::List => {
                    let pairs = workspace.store().config_all()?;
                    if json {
                        print_json(&pairs);
                    } else {
                        for (key, value) in &pairs {
                            println!("{key}={value}");
                        }
                    }
                }
                ConfigCommand::Get { key } => {
                    let pairs = workspace.store().config_all()?;
                    match pairs.get(&key) {
                        Some(value) => {
                            if json {
                                print_json(&serde_json::json!({ key: value }));
                            } else {
                                println!("{value}");
                            }
                        }
                        None => return Err(Error::usage(format!("config key not set: {key}"))),
                    }
                }
                ConfigCommand::Set { key, value } => {
                    workspace.store().config_set(&key, &value)?;
                    if !json {
                        println!("{key}={value}");
                    }
                }
            }
        }
    }

    Ok(exit::OK)
}

fn summary_line(issue: &Issue) -> String {
    format!(
        "{:<12} P{} {:<8} {:<12} {}",
        issue.id.as_str(),
        issue.priority,
        issue.issue_type.as_str(),
        issue.status.as_str(),
        issue.title
    )
}

fn print_full(issue: &Issue) {
    println!("{}: {}", issue.id, issue.title);
    println!(
        "  status {}  priority {}  type {}",
        issue.status, issue.priority, issue.issue_type
    );
    println!("  created {}  updated {}", issue.created_at, issue.updated_at);
    if let Some(closed_at) = issue.closed_at {
        let reason = issue.close_reason.as_deref().unwrap_or("-");
        println!("  closed {closed_at} ({reason})");
    }
    if let Some(external_ref) = &issue.external_ref {
        println!("  external {external_ref}");
    }
    if !issue.description.is_empty() {
        println!("  description: {}", issue.description);
    }
    if !issue.design.is_empty() {
        println!("  design: {}", issue.design);
    }
    if !issue.acceptance_criteria.is_empty() {
        println!("  acceptance: {}", issue.acceptance_criteria);
    }
    for dep in &issue.deps {
        println!("  dep: {} {}", dep.kind, dep.to);
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("cli payloads serialize")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_now_flag_parses() {
        let cli = Cli::parse_from(["bd", "--sync-now", "export"]);
        assert_eq!(cli.sync_now, Some(SyncNowAction::Export));
        assert!(cli.command.is_none());
    }

    #[test]
    fn create_with_deps_parses() {
        let cli = Cli::parse_from([
            "bd",
            "create",
            "a title",
            "--dep",
            "bd-a1b2c3d",
            "--dep",
            "bd-b2c3d4e:related-to",
            "-p",
            "1",
        ]);
        match cli.command {
            Some(Command::Create { deps, priority, .. }) => {
                assert_eq!(deps.len(), 2);
                assert_eq!(priority, Some(Priority::new(1).unwrap()));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
