//! Jobs: named top-level flows, their parameters, and the registry callers trigger them through.

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::flow::Flow;
use crate::engine::Executable;
use crate::engine::error::error_chain;
use crate::{BatchStatus, JobResult};

/// Accepted datetime formats for job parameters, tried in order.
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// String parameters for one job run (`key=value` on the CLI).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobParams(BTreeMap<String, String>);

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse `key=value` pairs. Rejects pairs without `=` or with an empty key.
    pub fn parse_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Self> {
        let mut params = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("job parameter '{pair}' is not key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("job parameter '{pair}' has an empty key"));
            }
            params.0.insert(key.to_string(), value.trim().to_string());
        }
        Ok(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| anyhow!("missing required job parameter '{key}'"))
    }

    /// Datetime parameter. A bare date (`2024-03-01`) means midnight.
    pub fn datetime(&self, key: &str) -> Result<NaiveDateTime> {
        let raw = self.require(key)?;
        parse_datetime(raw).with_context(|| format!("job parameter '{key}'"))
    }

    /// Datetime parameter, or the current local time when absent.
    pub fn datetime_or_now(&self, key: &str) -> Result<NaiveDateTime> {
        match self.get(key) {
            Some(_) => self.datetime(key),
            None => Ok(Local::now().naive_local()),
        }
    }

    /// Date parameter; a datetime value is truncated to its date.
    pub fn date(&self, key: &str) -> Result<NaiveDate> {
        self.datetime(key).map(|dt| dt.date())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is not a date or datetime"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN))
}

/// A named top-level flow.
pub struct Job {
    name: String,
    flow: Flow,
}

impl Job {
    pub fn new(name: &str, flow: Flow) -> Self {
        Self {
            name: name.to_string(),
            flow,
        }
    }

    /// A job whose flow is one step.
    pub fn single_step(name: &str, step: impl Executable + 'static) -> Self {
        Self::new(name, Flow::single(name, step))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the flow to completion. A failed job is not retried; the next scheduled run picks up
    /// whatever the failed one left unprocessed.
    pub fn run(&mut self, params: &JobParams) -> JobResult {
        let started_at = Local::now();
        info!("Job [{}] launched with {:?}", self.name, params.as_map());
        let flow = self.flow.execute();
        let ended_at = Local::now();
        let result = JobResult {
            job: self.name.clone(),
            status: flow.status,
            params: params.as_map().clone(),
            started_at,
            ended_at,
            flow,
        };
        match result.status {
            BatchStatus::Completed => info!(
                "Job [{}] COMPLETED in {}ms",
                self.name,
                (ended_at - started_at).num_milliseconds()
            ),
            BatchStatus::Failed => error!(
                "Job [{}] FAILED: {}",
                self.name,
                result
                    .first_error()
                    .map(|e| error_chain(e))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
        result
    }
}

type JobFactory<C> = Box<dyn Fn(&C, &JobParams) -> Result<Job> + Send + Sync>;

/// Name → job factory. Each launch builds a fresh job (fresh sources, committers, contexts).
pub struct JobRegistry<C> {
    factories: BTreeMap<String, JobFactory<C>>,
}

impl<C> Default for JobRegistry<C> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<C> JobRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&C, &JobParams) -> Result<Job> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the job without running it. Fails on unknown names and invalid parameters.
    pub fn build(&self, ctx: &C, name: &str, params: &JobParams) -> Result<Job> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("no job registered under name '{name}'"))?;
        factory(ctx, params).with_context(|| format!("build job '{name}'"))
    }

    /// Build and run synchronously.
    pub fn launch(&self, ctx: &C, name: &str, params: &JobParams) -> Result<JobResult> {
        let mut job = self.build(ctx, name, params)?;
        Ok(job.run(params))
    }
}

/// Handle to a job launched on a background thread.
pub struct JobHandle {
    name: String,
    handle: JoinHandle<Result<JobResult>>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(self) -> Result<JobResult> {
        self.handle
            .join()
            .map_err(|_| anyhow!("job thread '{}' panicked", self.name))?
    }
}

impl<C: Send + Sync + 'static> JobRegistry<C> {
    /// Build and run on a background thread.
    pub fn spawn(
        self: &Arc<Self>,
        ctx: Arc<C>,
        name: &str,
        params: JobParams,
    ) -> Result<JobHandle> {
        let registry = Arc::clone(self);
        let job_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("job-{name}"))
            .spawn(move || registry.launch(&ctx, &job_name, &params))
            .context("spawn job thread")?;
        Ok(JobHandle {
            name: name.to_string(),
            handle,
        })
    }
}
