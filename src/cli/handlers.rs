//! Command handlers for init, list and run.

use anyhow::{Context, Result};
use colored::Colorize;
use log::{debug, info};
use std::process::ExitCode;

use super::arg_parser::{Cli, Command};
use crate::engine::error::error_chain;
use crate::jobs::{JobContext, default_registry};
use crate::pipeline::JobParams;
use crate::store::Database;
use crate::utils::{load_settings, resolve_db_path, setup_logging};
use crate::{BatchStatus, JobResult, Settings};

/// Settings from the config file with CLI flags on top; installs logging.
fn setup_settings(cli: &Cli) -> Result<Settings> {
    let cwd = std::env::current_dir().context("read working directory")?;
    let mut settings = load_settings(cli.config.as_deref(), &cwd)?;
    if let Some(db) = &cli.db {
        settings.db_path = Some(db.clone());
    }
    if let Some(v) = cli.verbose {
        settings.verbose = v;
    }
    setup_logging(settings.verbose);
    settings.db_path = Some(resolve_db_path(settings.db_path.as_deref(), &cwd));
    debug!("{} CONFIG: {:#?}", env!("CARGO_PKG_NAME").to_uppercase(), settings);
    Ok(settings)
}

/// Dispatch the subcommand. `Err` is a setup problem; a FAILED job is a non-zero exit code.
pub fn handle_run(cli: &Cli) -> Result<ExitCode> {
    let settings = setup_settings(cli)?;
    let db = Database::new(settings.db_path.clone().unwrap_or_default());
    match &cli.command {
        Command::Init => {
            db.init_schema()?;
            info!("Schema ready at {}", db.path().display());
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            for name in default_registry().names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { job, params, json } => {
            let params = JobParams::parse_pairs(params)?;
            db.init_schema()?;
            let ctx = JobContext::new(db, settings);
            let result = default_registry().launch(&ctx, job, &params)?;
            if *json {
                let out = serde_json::to_string_pretty(&result).context("serialize job result")?;
                println!("{out}");
            } else {
                print_summary(&result);
            }
            Ok(match result.status {
                BatchStatus::Completed => ExitCode::SUCCESS,
                BatchStatus::Failed => ExitCode::FAILURE,
            })
        }
    }
}

fn print_summary(result: &JobResult) {
    let status = match result.status {
        BatchStatus::Completed => result.status.as_str().green(),
        BatchStatus::Failed => result.status.as_str().red(),
    };
    let elapsed = (result.ended_at - result.started_at).num_milliseconds();
    println!("{} {} in {}ms", result.job.bold(), status, elapsed);
    for step in result.steps() {
        let c = step.counts;
        println!(
            "  {:<28} {:<9} read={} written={} filtered={} skipped={} persisted={} commits={}",
            step.name,
            step.status.as_str(),
            c.read,
            c.written,
            c.filtered,
            c.skipped,
            c.persisted,
            c.commits
        );
        if let Some(e) = &step.error {
            println!("    {}", error_chain(e).red());
        }
    }
}
