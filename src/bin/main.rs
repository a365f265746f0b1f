use std::process::ExitCode;

use clap::Parser;

use beads::cli::{Cli, Command, DaemonCommand};
use beads::paths::{BeadsPaths, LOG_ENV};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    init_tracing(&cli);

    match beads::cli::run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            if json {
                eprintln!(
                    "{}",
                    serde_json::json!({ "error": err.to_string(), "code": err.code() })
                );
            } else {
                eprintln!("error ({}): {err}", err.code());
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

/// One-shot invocations log to stderr at `warn` unless `BEADS_LOG`
/// raises it; the daemon appends to `daemon.log` in the database dir.
fn init_tracing(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let daemon_run = matches!(
        cli.command,
        Some(Command::Daemon {
            command: DaemonCommand::Run
        })
    );

    if daemon_run {
        let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
        let paths = BeadsPaths::discover(&cwd);
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.daemon_log())
        {
            let filter =
                EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
