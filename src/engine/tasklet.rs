//! Tasklet step: one fallible unit of work run once, for jobs that are a single bulk operation.

use anyhow::Result;
use log::info;
use std::time::Instant;

use super::error::StepError;
use super::step::{Executable, conclude};
use crate::{ExecutionContext, StepResult, StepState};

/// Work done by a tasklet step. May record counts in `ctx`.
pub trait Tasklet: Send {
    fn execute(&mut self, ctx: &mut ExecutionContext) -> Result<()>;
}

impl<F> Tasklet for F
where
    F: FnMut(&mut ExecutionContext) -> Result<()> + Send,
{
    fn execute(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        self(ctx)
    }
}

pub struct TaskletStep {
    name: String,
    tasklet: Box<dyn Tasklet>,
    state: StepState,
}

impl TaskletStep {
    pub fn new(name: &str, tasklet: impl Tasklet + 'static) -> Self {
        Self {
            name: name.to_string(),
            tasklet: Box::new(tasklet),
            state: StepState::Ready,
        }
    }

    /// Closure-friendly [`Self::new`].
    pub fn from_fn<F>(name: &str, f: F) -> Self
    where
        F: FnMut(&mut ExecutionContext) -> Result<()> + Send + 'static,
    {
        Self::new(name, f)
    }
}

impl Executable for TaskletStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StepState {
        self.state
    }

    fn execute(&mut self) -> StepResult {
        let started = Instant::now();
        self.state = StepState::Running;
        info!("Executing tasklet step [{}]", self.name);
        let mut ctx = ExecutionContext::new(&self.name);
        let outcome = self.tasklet.execute(&mut ctx).map_err(StepError::Tasklet);
        conclude(&mut self.state, ctx, outcome, started)
    }
}
