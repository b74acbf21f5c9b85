use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use rugbase::commands::{self, CommandError};
use rugbase::updater::exit_code_for;
use rugbase::{AppConfig, AppState, BatchOutcome};
use serde::Serialize;
use tracing::warn;

#[derive(Parser)]
#[command(name = "rugbase", version, about = "RugBase inventory sync and update engine")]
#[command(group(ArgGroup::new("mode").multiple(false)))]
struct Cli {
    /// Check, download, verify, and install the latest version without prompting.
    #[arg(long, group = "mode")]
    batch_update: bool,
    /// Report whether a newer version is available.
    #[arg(long, group = "mode")]
    check_update: bool,
    /// Run one sync session against the configured spreadsheet.
    #[arg(long, group = "mode")]
    sync_now: bool,
    /// Check that the service account can edit the spreadsheet and Drive folder.
    #[arg(long, group = "mode")]
    verify_access: bool,
    /// Upload a snapshot of the catalog to the configured Drive folder.
    #[arg(long, group = "mode")]
    backup_drive: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rugbase: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let state = AppState::initialize(AppConfig::from_env())
        .context("failed to open the RugBase data directory")?;

    if cli.batch_update {
        let updater = state.updater().context("update source is misconfigured")?;
        let outcome = updater.batch_update().await;
        match &outcome {
            BatchOutcome::UpToDate { version } => println!("rugbase {version} is up to date"),
            BatchOutcome::Installed { version } => println!("installed rugbase {version}"),
            BatchOutcome::Failed(err) => eprintln!("update failed: {err}"),
        }
        return Ok(ExitCode::from(outcome.exit_code() as u8));
    }

    confirm_previous_update(&state);

    if cli.check_update {
        let updater = state.updater().context("update source is misconfigured")?;
        return match updater.check_for_update().await {
            Ok(Some(package)) => {
                println!("rugbase {} is available", package.version);
                Ok(ExitCode::SUCCESS)
            }
            Ok(None) => {
                println!("rugbase {} is up to date", updater.current_version());
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                let code = exit_code_for(&err);
                report_failure(&CommandError::from(err));
                Ok(ExitCode::from(code as u8))
            }
        };
    }
    if cli.sync_now {
        return finish(commands::sync_now(&state).await);
    }
    if cli.verify_access {
        return finish(commands::check_access(&state).await);
    }
    if cli.backup_drive {
        return finish(commands::backup_to_drive(&state).await);
    }
    finish(commands::foundation_health(&state))
}

fn confirm_previous_update(state: &AppState) {
    let confirmed = state
        .updater()
        .map_err(|err| err.to_string())
        .and_then(|updater| updater.confirm_startup().map_err(|err| err.to_string()));
    if let Err(err) = confirmed {
        warn!(target: "updater", error = %err, "could not confirm the previous update");
    }
}

fn finish<T: Serialize>(result: Result<T, CommandError>) -> Result<ExitCode> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            report_failure(&err);
            Ok(ExitCode::from(1))
        }
    }
}

fn report_failure(err: &CommandError) {
    eprintln!("error: {}", err.message);
    eprintln!("{}", err.guidance);
}
