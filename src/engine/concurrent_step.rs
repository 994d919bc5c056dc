//! Multi-threaded chunk step: W workers share one [`ConcurrentSource`], each running its own
//! chunk loop with its own committer and its own [`ExecutionContext`].
//!
//! Shared mutable state is limited to the source (serialized by its gate), the step-wide skip
//! tally and a halt flag: once any worker fails, the others finish their current chunk and stop
//! reading.

use log::{debug, info};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use super::async_stage::CommitReceipt;
use super::chunk::{SkipTally, TransformStage, apply_receipt, read_chunk, transform_chunk};
use super::committer::Committer;
use super::error::{StepError, panic_message};
use super::source::ConcurrentSource;
use super::step::{Executable, StepConfig, conclude};
use crate::{ExecutionContext, StepResult, StepState};

/// Builds one committer per worker (each opens its own connection).
pub type CommitterFactory<O> = Arc<dyn Fn() -> Box<dyn Committer<O>> + Send + Sync>;

const NO_FAILURE: usize = usize::MAX;

type WorkerOutcome = (ExecutionContext, Result<(), StepError>);

pub struct ConcurrentChunkStep<I, O> {
    name: String,
    source: Arc<dyn ConcurrentSource<Item = I>>,
    transform: TransformStage<I, O>,
    committers: CommitterFactory<O>,
    workers: usize,
    config: StepConfig,
    state: StepState,
}

impl<I, O> ConcurrentChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: &str,
        source: Arc<dyn ConcurrentSource<Item = I>>,
        transform: TransformStage<I, O>,
        committers: CommitterFactory<O>,
        workers: usize,
        config: StepConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            source,
            transform,
            committers,
            workers,
            config,
            state: StepState::Ready,
        }
    }

    fn worker_name(&self, id: usize) -> String {
        format!("{}-worker-{}", self.name, id)
    }

    fn run(&mut self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        self.config.validate()?;
        if self.workers == 0 {
            return Err(StepError::Config("worker count must be > 0".to_string()));
        }
        self.source.open().map_err(StepError::Resource)?;

        let halt = AtomicBool::new(false);
        let first_failed = AtomicUsize::new(NO_FAILURE);
        let skips = SkipTally::default();
        let shared = WorkerShared {
            source: self.source.as_ref(),
            transform: &self.transform,
            config: self.config,
            skips: &skips,
            halt: &halt,
            first_failed: &first_failed,
        };

        let outcomes: Vec<WorkerOutcome> = thread::scope(|scope| {
            let spawned: Vec<_> = (0..self.workers)
                .map(|id| {
                    let name = self.worker_name(id);
                    let committer = (self.committers)();
                    let shared = &shared;
                    let handle = thread::Builder::new()
                        .name(name.clone())
                        .spawn_scoped(scope, move || shared.run_worker(id, &name, committer));
                    (id, handle)
                })
                .collect();
            spawned
                .into_iter()
                .map(|(id, handle)| {
                    let name = self.worker_name(id);
                    match handle {
                        Ok(h) => h.join().unwrap_or_else(|payload| {
                            shared.fail(id);
                            let message = panic_message(payload.as_ref());
                            (
                                ExecutionContext::new(&name),
                                Err(StepError::WorkerPanicked { name, message }),
                            )
                        }),
                        Err(e) => {
                            shared.fail(id);
                            (
                                ExecutionContext::new(&name),
                                Err(StepError::Resource(e.into())),
                            )
                        }
                    }
                })
                .collect()
        });

        self.source.close();

        let failed_worker = first_failed.load(Ordering::SeqCst);
        let mut first_error = None;
        for (id, (worker_ctx, result)) in outcomes.into_iter().enumerate() {
            ctx.counts += worker_ctx.counts;
            ctx.chunk += worker_ctx.chunk;
            if let Err(e) = result
                && (first_error.is_none() || id == failed_worker)
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct WorkerShared<'a, I, O> {
    source: &'a dyn ConcurrentSource<Item = I>,
    transform: &'a TransformStage<I, O>,
    config: StepConfig,
    skips: &'a SkipTally,
    halt: &'a AtomicBool,
    first_failed: &'a AtomicUsize,
}

impl<I, O> WorkerShared<'_, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn fail(&self, id: usize) {
        self.halt.store(true, Ordering::SeqCst);
        let _ = self.first_failed.compare_exchange(
            NO_FAILURE,
            id,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn run_worker(
        &self,
        id: usize,
        name: &str,
        mut committer: Box<dyn Committer<O>>,
    ) -> WorkerOutcome {
        let mut ctx = ExecutionContext::new(name);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            committer.open().map_err(StepError::Resource)?;
            let looped = self.worker_loop(&mut ctx, committer.as_mut());
            committer.close();
            looped
        }))
        .unwrap_or_else(|payload| {
            Err(StepError::WorkerPanicked {
                name: name.to_string(),
                message: panic_message(payload.as_ref()),
            })
        });
        if result.is_err() {
            self.fail(id);
        }
        debug!(
            "[{}] worker done: read={} written={}",
            name, ctx.counts.read, ctx.counts.written
        );
        (ctx, result)
    }

    fn worker_loop(
        &self,
        ctx: &mut ExecutionContext,
        committer: &mut dyn Committer<O>,
    ) -> Result<(), StepError> {
        loop {
            if self.halt.load(Ordering::SeqCst) {
                return Ok(());
            }
            let chunk = read_chunk(|| self.source.read(), self.config.chunk_size, ctx)?;
            if chunk.items.is_empty() {
                return Ok(());
            }
            let out = transform_chunk(
                self.transform,
                chunk.items,
                self.config.on_transform_error,
                self.skips,
                ctx,
            )?;
            let size = out.len();
            let result = committer.commit(out);
            apply_receipt(
                CommitReceipt {
                    chunk: ctx.chunk,
                    size,
                    result,
                },
                ctx,
            )?;
            if chunk.end_of_stream {
                return Ok(());
            }
        }
    }
}

impl<I, O> Executable for ConcurrentChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StepState {
        self.state
    }

    fn execute(&mut self) -> StepResult {
        let started = Instant::now();
        self.state = StepState::Running;
        info!(
            "Executing step [{}] on {} workers (chunk size {})",
            self.name, self.workers, self.config.chunk_size
        );
        let mut ctx = ExecutionContext::new(&self.name);
        let outcome = self.run(&mut ctx);
        conclude(&mut self.state, ctx, outcome, started)
    }
}
