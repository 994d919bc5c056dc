//! passbatch CLI: create the schema, list jobs, run a job.

use anyhow::Result;
use clap::Parser;
use passbatch::cli::{Cli, handle_run};
use std::process::ExitCode;
use std::time::Instant;

fn main() -> Result<ExitCode> {
    let start_time = Instant::now();
    let cli = Cli::parse();
    let code = handle_run(&cli)?;
    log::debug!("Total time: {:?}", start_time.elapsed());
    Ok(code)
}
