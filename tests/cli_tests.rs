use clap::Parser;
use passbatch::cli::{Cli, Command};
use passbatch::engine::TaskletStep;
use passbatch::pipeline::{Job, JobParams};
use std::path::Path;

// --- argument parsing ---

#[test]
fn test_parse_run_with_params() {
    let cli = Cli::try_parse_from([
        "passbatch",
        "--db",
        "/data/batch.db",
        "run",
        "makeStatisticsJob",
        "-p",
        "from=2024-03-01",
        "--param",
        "to=2024-03-31",
        "--json",
    ])
    .unwrap();
    assert_eq!(cli.db.as_deref(), Some(Path::new("/data/batch.db")));
    assert_eq!(cli.verbose, None);
    match cli.command {
        Command::Run { job, params, json } => {
            assert_eq!(job, "makeStatisticsJob");
            assert_eq!(params, vec!["from=2024-03-01", "to=2024-03-31"]);
            assert!(json);
        }
        other => panic!("expected run, got {other:?}"),
    }
}

#[test]
fn test_parse_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["passbatch", "list", "-v", "-c", "batch.toml"]).unwrap();
    assert_eq!(cli.verbose, Some(true));
    assert_eq!(cli.config.as_deref(), Some(Path::new("batch.toml")));
    assert!(matches!(cli.command, Command::List));

    let quiet = Cli::try_parse_from(["passbatch", "init", "--verbose", "false"]).unwrap();
    assert_eq!(quiet.verbose, Some(false));
}

#[test]
fn test_parse_requires_subcommand_and_job() {
    assert!(Cli::try_parse_from(["passbatch"]).is_err());
    assert!(Cli::try_parse_from(["passbatch", "run"]).is_err());
}

// --- json output ---

#[test]
fn test_job_result_serializes_to_json() {
    let step = TaskletStep::from_fn("onlyStep", |ctx| {
        ctx.counts.read = 2;
        ctx.counts.written = 2;
        Ok(())
    });
    let mut job = Job::single_step("demoJob", step);
    let result = job.run(&JobParams::new().with("now", "2024-03-01T10:00"));
    let value: serde_json::Value = serde_json::to_value(&result).unwrap();

    assert_eq!(value["job"], "demoJob");
    assert_eq!(value["status"], "COMPLETED");
    assert_eq!(value["params"]["now"], "2024-03-01T10:00");
    let step = &value["flow"]["children"][0];
    assert_eq!(step["kind"], "step");
    assert_eq!(step["name"], "onlyStep");
    assert_eq!(step["counts"]["read"], 2);
    assert!(step["error"].is_null());
}

#[test]
fn test_failed_step_serializes_error_chain() {
    let step = TaskletStep::from_fn("badStep", |_ctx| Err(anyhow::anyhow!("disk on fire")));
    let mut job = Job::single_step("badJob", step);
    let result = job.run(&JobParams::new());
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "FAILED");
    let error = value["flow"]["children"][0]["error"].as_str().unwrap();
    assert!(error.contains("tasklet failed: disk on fire"), "{error}");
}
