//! Chunk-oriented step: source → transformer → committer, one chunk at a time.

use anyhow::Result;
use log::{error, info};
use std::time::Instant;

use super::async_stage::{AsyncCommitter, CommitReceipt, WorkerPool};
use super::chunk::{SkipTally, TransformStage, apply_receipt, read_chunk, transform_chunk};
use super::committer::Committer;
use super::error::{StepError, error_chain};
use super::source::ItemSource;
use super::transform::TransformErrorPolicy;
use crate::{BatchStatus, ExecutionContext, StepResult, StepState};

/// Anything a flow can run: chunk steps, multi-threaded chunk steps, tasklets.
pub trait Executable: Send {
    fn name(&self) -> &str;

    fn state(&self) -> StepState;

    /// Run to completion or failure. Never panics on step errors; they land in the result.
    fn execute(&mut self) -> StepResult;
}

/// Explicit, validated per-step settings.
#[derive(Clone, Copy, Debug)]
pub struct StepConfig {
    pub chunk_size: usize,
    pub on_transform_error: TransformErrorPolicy,
}

impl StepConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            on_transform_error: TransformErrorPolicy::FailFast,
        }
    }

    pub fn skip_errors(mut self, limit: Option<usize>) -> Self {
        self.on_transform_error = TransformErrorPolicy::Skip { limit };
        self
    }

    pub fn validate(&self) -> std::result::Result<(), StepError> {
        if self.chunk_size == 0 {
            return Err(StepError::Config("chunk size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// How chunks are handed to the committer.
pub enum CommitStage<O> {
    Sync(Box<dyn Committer<O>>),
    /// Write chunk k on a worker while chunk k+1 is read and transformed.
    Async(AsyncCommitter<O>),
}

impl<O: Send + 'static> CommitStage<O> {
    pub fn sync(committer: impl Committer<O> + 'static) -> Self {
        CommitStage::Sync(Box::new(committer))
    }

    /// Closure-friendly [`Self::sync`].
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(Vec<O>) -> Result<usize> + Send + 'static,
    {
        CommitStage::Sync(Box::new(f))
    }

    pub fn background(committer: impl Committer<O> + 'static, pool: WorkerPool) -> Self {
        CommitStage::Async(AsyncCommitter::new(Box::new(committer), pool))
    }

    fn open(&mut self) -> Result<()> {
        match self {
            CommitStage::Sync(c) => c.open(),
            CommitStage::Async(c) => c.open(),
        }
    }

    fn close(&mut self) {
        match self {
            CommitStage::Sync(c) => c.close(),
            CommitStage::Async(c) => c.close(),
        }
    }

    /// Commit (sync) or submit (async) one transformed chunk. For async, the previous write is
    /// resolved first so commits stay in read order and at most one is outstanding.
    fn commit(
        &mut self,
        chunk: Vec<O>,
        ctx: &mut ExecutionContext,
    ) -> std::result::Result<(), StepError> {
        match self {
            CommitStage::Sync(c) => {
                let size = chunk.len();
                let result = c.commit(chunk);
                apply_receipt(
                    CommitReceipt {
                        chunk: ctx.chunk,
                        size,
                        result,
                    },
                    ctx,
                )
            }
            CommitStage::Async(c) => {
                if let Some(receipt) = c.resolve() {
                    apply_receipt(receipt, ctx)?;
                }
                let size = chunk.len();
                c.submit(ctx.chunk, chunk)
                    .map_err(|source| StepError::Commit {
                        chunk: ctx.chunk,
                        size,
                        source,
                    })
            }
        }
    }

    /// Wait for any outstanding write. Must run before the step reports its counts.
    fn settle(&mut self, ctx: &mut ExecutionContext) -> std::result::Result<(), StepError> {
        match self {
            CommitStage::Sync(_) => Ok(()),
            CommitStage::Async(c) => match c.resolve() {
                Some(receipt) => apply_receipt(receipt, ctx),
                None => Ok(()),
            },
        }
    }
}

/// Single-threaded chunk step.
pub struct ChunkStep<I, O> {
    name: String,
    source: Box<dyn ItemSource<Item = I>>,
    transform: TransformStage<I, O>,
    commit: CommitStage<O>,
    config: StepConfig,
    state: StepState,
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        name: &str,
        source: impl ItemSource<Item = I> + 'static,
        transform: TransformStage<I, O>,
        commit: CommitStage<O>,
        config: StepConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            source: Box::new(source),
            transform,
            commit,
            config,
            state: StepState::Ready,
        }
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    fn run(&mut self, ctx: &mut ExecutionContext) -> std::result::Result<(), StepError> {
        self.config.validate()?;
        self.source.open().map_err(StepError::Resource)?;
        if let Err(e) = self.commit.open() {
            self.source.close();
            return Err(StepError::Resource(e));
        }
        let looped = self.chunk_loop(ctx);
        // A write may still be in flight when the loop bailed on a read or transform error.
        let settled = self.commit.settle(ctx);
        self.commit.close();
        self.source.close();
        looped.and(settled)
    }

    fn chunk_loop(&mut self, ctx: &mut ExecutionContext) -> std::result::Result<(), StepError> {
        let size = self.config.chunk_size;
        let policy = self.config.on_transform_error;
        let skips = SkipTally::default();
        loop {
            let source = &mut self.source;
            let chunk = read_chunk(|| source.read(), size, ctx)?;
            if chunk.items.is_empty() {
                return Ok(());
            }
            let out = transform_chunk(&self.transform, chunk.items, policy, &skips, ctx)?;
            self.commit.commit(out, ctx)?;
            if chunk.end_of_stream {
                return Ok(());
            }
        }
    }
}

impl<I, O> Executable for ChunkStep<I, O>
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
            "Executing step [{}] (chunk size {})",
            self.name, self.config.chunk_size
        );
        let mut ctx = ExecutionContext::new(&self.name);
        let outcome = self.run(&mut ctx);
        conclude(&mut self.state, ctx, outcome, started)
    }
}

/// Move a step to its terminal state and build its result.
pub(crate) fn conclude(
    state: &mut StepState,
    ctx: ExecutionContext,
    outcome: std::result::Result<(), StepError>,
    started: Instant,
) -> StepResult {
    let elapsed = started.elapsed();
    let c = ctx.counts;
    let (status, error) = match outcome {
        Ok(()) => {
            *state = StepState::Completed;
            info!(
                "Step [{}] COMPLETED in {:?}: read={} written={} filtered={} skipped={} commits={}",
                ctx.step, elapsed, c.read, c.written, c.filtered, c.skipped, c.commits
            );
            (BatchStatus::Completed, None)
        }
        Err(e) => {
            *state = StepState::Failed;
            error!(
                "Step [{}] FAILED after read={} written={}: {}",
                ctx.step,
                c.read,
                c.written,
                error_chain(&e)
            );
            (BatchStatus::Failed, Some(e))
        }
    };
    StepResult {
        name: ctx.step,
        status,
        counts: c,
        error,
        elapsed_ms: elapsed.as_millis(),
    }
}
