//! Public types for the passbatch API: step/flow/job results, counts, and settings.

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use std::path::PathBuf;

use crate::engine::StepError;
use crate::engine::error::error_chain;

/// Terminal status of a step, flow or job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_failed(self) -> bool {
        self == BatchStatus::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }
}

/// Lifecycle of a step: `Ready → Running → {Completed, Failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Ready,
    Running,
    Completed,
    Failed,
}

/// Per-step record counts.
///
/// `read = written + filtered + skipped` for a step that completed. `persisted` is what the
/// committer reports it durably changed and may be lower than `written`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub read: usize,
    pub filtered: usize,
    pub skipped: usize,
    pub written: usize,
    pub persisted: usize,
    pub commits: usize,
}

impl AddAssign for StepCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.read += rhs.read;
        self.filtered += rhs.filtered;
        self.skipped += rhs.skipped;
        self.written += rhs.written;
        self.persisted += rhs.persisted;
        self.commits += rhs.commits;
    }
}

/// Mutable state owned by one running step (or one worker of a multi-threaded step).
/// Created when the step starts, discarded when it ends.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub step: String,
    pub counts: StepCounts,
    /// Ordinal of the last chunk read (1-based; 0 before the first chunk).
    pub chunk: usize,
}

impl ExecutionContext {
    pub fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            counts: StepCounts::default(),
            chunk: 0,
        }
    }
}

fn serialize_error<S>(error: &Option<StepError>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match error {
        Some(e) => s.serialize_some(&error_chain(e)),
        None => s.serialize_none(),
    }
}

/// Terminal result of one step. Immutable once built.
#[derive(Debug, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: BatchStatus,
    pub counts: StepCounts,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<StepError>,
    pub elapsed_ms: u128,
}

impl StepResult {
    /// A failed result for a step that never produced counts (e.g. a panicked branch).
    pub fn failed(name: &str, error: StepError) -> Self {
        Self {
            name: name.to_string(),
            status: BatchStatus::Failed,
            counts: StepCounts::default(),
            error: Some(error),
            elapsed_ms: 0,
        }
    }
}

/// One child of a flow result.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Outcome {
    Step(StepResult),
    Flow(FlowResult),
}

impl Outcome {
    pub fn status(&self) -> BatchStatus {
        match self {
            Outcome::Step(s) => s.status,
            Outcome::Flow(f) => f.status,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Outcome::Step(s) => &s.name,
            Outcome::Flow(f) => &f.name,
        }
    }
}

/// Aggregated result of a sequential or parallel flow.
#[derive(Debug, Serialize)]
pub struct FlowResult {
    pub name: String,
    pub parallel: bool,
    pub status: BatchStatus,
    pub children: Vec<Outcome>,
}

impl FlowResult {
    /// First fatal error in declaration order (depth-first).
    pub fn first_error(&self) -> Option<&StepError> {
        self.children.iter().find_map(|c| match c {
            Outcome::Step(s) => s.error.as_ref(),
            Outcome::Flow(f) => f.first_error(),
        })
    }

    /// Every step result in this flow, depth-first in declaration order.
    pub fn steps(&self) -> Vec<&StepResult> {
        let mut out = Vec::new();
        collect_steps(self, &mut out);
        out
    }
}

fn collect_steps<'a>(flow: &'a FlowResult, out: &mut Vec<&'a StepResult>) {
    for child in &flow.children {
        match child {
            Outcome::Step(s) => out.push(s),
            Outcome::Flow(f) => collect_steps(f, out),
        }
    }
}

/// Result of one job run.
#[derive(Debug, Serialize)]
pub struct JobResult {
    pub job: String,
    pub status: BatchStatus,
    pub params: BTreeMap<String, String>,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub flow: FlowResult,
}

impl JobResult {
    pub fn first_error(&self) -> Option<&StepError> {
        self.flow.first_error()
    }

    pub fn steps(&self) -> Vec<&StepResult> {
        self.flow.steps()
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps().into_iter().find(|s| s.name == name)
    }
}

/// Per-job overrides (config file `[jobs.<name>]`). Unset fields fall back to the job's defaults.
#[derive(Clone, Debug, Default)]
pub struct JobSettings {
    pub chunk_size: Option<usize>,
    pub page_size: Option<usize>,
    pub workers: Option<usize>,
    pub skip_limit: Option<usize>,
}

/// Full settings (CLI and config file).
#[derive(Clone, Debug, Default)]
pub struct Settings {
    /// SQLite database path. When None, resolved from `PASSBATCH_DB` / `.env` / default filename.
    pub db_path: Option<PathBuf>,
    /// Directory for report files. When None, the current directory.
    pub report_dir: Option<PathBuf>,
    /// Debug logging.
    pub verbose: bool,
    /// Overrides keyed by job name.
    pub jobs: HashMap<String, JobSettings>,
}

impl Settings {
    /// Overrides for `job`, or all-defaults when the job has no table.
    pub fn job(&self, job: &str) -> JobSettings {
        self.jobs.get(job).cloned().unwrap_or_default()
    }
}
