use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chunk-oriented batch jobs over the pass/booking database.
#[derive(Clone, Debug, Parser)]
#[command(name = "passbatch")]
#[command(about = "Run pass, notification and statistics batch jobs.")]
pub struct Cli {
    /// SQLite database. Default: config file, then PASSBATCH_DB (or .env), then `passbatch.db`.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Config file. Default: `passbatch.toml` in the working directory, if present.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output.
    #[arg(long, short = 'v', global = true, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Create the schema (idempotent).
    Init,

    /// List registered jobs.
    List,

    /// Run one job to completion. Exits non-zero when the job FAILED.
    Run {
        /// Job name, e.g. expirePassesJob.
        job: String,

        /// Job parameter as key=value (repeatable), e.g. -p from=2024-03-01T00:00.
        #[arg(long = "param", short = 'p', value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Print the job result as JSON.
        #[arg(long)]
        json: bool,
    },
}
