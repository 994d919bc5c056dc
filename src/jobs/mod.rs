//! Domain jobs over the pass/booking store, and the registry that names them.

pub mod collaborators;
pub mod entities;
pub mod notification;
pub mod pass;
pub mod statistics;

pub use collaborators::{CsvReportWriter, LogNotifier, Notifier, ReportWriter};

use anyhow::{Result, anyhow};
use std::sync::Arc;

use crate::engine::{StepConfig, WorkerPool};
use crate::pipeline::JobRegistry;
use crate::store::Database;
use crate::utils::config::WorkerPoolLimits;
use crate::{JobSettings, Settings};

pub const EXPIRE_PASSES_JOB: &str = "expirePassesJob";
pub const USE_PASSES_JOB: &str = "usePassesJob";
pub const ADD_PASSES_JOB: &str = "addPassesJob";
pub const SEND_NOTIFICATION_JOB: &str = "sendNotificationBeforeClassJob";
pub const MAKE_STATISTICS_JOB: &str = "makeStatisticsJob";

/// Everything a job factory needs: the store, settings, and the outbound collaborators.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub settings: Settings,
    pub notifier: Arc<dyn Notifier>,
    pub reports: Arc<dyn ReportWriter>,
}

impl JobContext {
    /// Logging notifier and CSV reports under `settings.report_dir` (or the working directory).
    pub fn new(db: Database, settings: Settings) -> Self {
        let report_dir = settings
            .report_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        Self {
            db,
            settings,
            notifier: Arc::new(LogNotifier),
            reports: Arc::new(CsvReportWriter::new(report_dir)),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportWriter>) -> Self {
        self.reports = reports;
        self
    }

    pub fn job_settings(&self, job: &str) -> JobSettings {
        self.settings.job(job)
    }
}

/// Registry with every domain job.
pub fn default_registry() -> JobRegistry<JobContext> {
    let mut registry = JobRegistry::new();
    registry
        .register(EXPIRE_PASSES_JOB, pass::expire_passes_job)
        .register(USE_PASSES_JOB, pass::use_passes_job)
        .register(ADD_PASSES_JOB, pass::add_passes_job)
        .register(SEND_NOTIFICATION_JOB, notification::send_notification_job)
        .register(MAKE_STATISTICS_JOB, statistics::make_statistics_job);
    registry
}

/// Step settings from `[jobs.<name>]`, falling back to the job's chunk size.
pub(crate) fn step_config(settings: &JobSettings, default_chunk: usize) -> StepConfig {
    let config = StepConfig::new(settings.chunk_size.unwrap_or(default_chunk));
    match settings.skip_limit {
        Some(limit) => config.skip_errors(Some(limit)),
        None => config,
    }
}

/// Worker count from `[jobs.<name>]`, else sized from the available threads.
pub(crate) fn worker_count(settings: &JobSettings) -> Result<usize> {
    let workers = settings
        .workers
        .unwrap_or_else(|| WorkerPoolLimits::current().default_size());
    if workers == 0 {
        return Err(anyhow!("worker count must be > 0"));
    }
    Ok(workers)
}

pub(crate) fn worker_pool(name: &str, settings: &JobSettings) -> Result<WorkerPool> {
    WorkerPool::new(name, worker_count(settings)?)
}
