//! One chunk cycle, shared by the single- and multi-threaded step drivers:
//! read up to N records, transform them, hand the survivors to the committer.

use anyhow::Result;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::async_stage::{AsyncTransformer, CommitReceipt, WorkerPool};
use super::error::StepError;
use super::transform::{TransformErrorPolicy, Transformed, Transformer};
use crate::ExecutionContext;

/// Records read for one chunk, plus whether the source reported end of stream.
pub(crate) struct ReadChunk<I> {
    pub items: Vec<I>,
    pub end_of_stream: bool,
}

/// Pull records until `size` are buffered or the source ends. Bumps `ctx.chunk` when at least
/// one record was read.
pub(crate) fn read_chunk<I>(
    mut next: impl FnMut() -> Result<Option<I>>,
    size: usize,
    ctx: &mut ExecutionContext,
) -> std::result::Result<ReadChunk<I>, StepError> {
    let mut items = Vec::with_capacity(size);
    let mut end_of_stream = false;
    while items.len() < size {
        match next() {
            Ok(Some(item)) => {
                items.push(item);
                ctx.counts.read += 1;
            }
            Ok(None) => {
                end_of_stream = true;
                break;
            }
            Err(source) => {
                return Err(StepError::Source {
                    read: ctx.counts.read,
                    source,
                });
            }
        }
    }
    if !items.is_empty() {
        ctx.chunk += 1;
    }
    Ok(ReadChunk {
        items,
        end_of_stream,
    })
}

/// How the records of a chunk are transformed.
pub enum TransformStage<I, O> {
    /// Record by record on the step's own thread.
    Sync(Arc<dyn Transformer<I, O>>),
    /// Each record on a worker pool; results reconciled in read order before commit.
    Async(AsyncTransformer<I, O>),
}

impl<I, O> TransformStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn sync(transformer: impl Transformer<I, O> + 'static) -> Self {
        TransformStage::Sync(Arc::new(transformer))
    }

    /// Closure-friendly [`Self::sync`].
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(I) -> Result<Transformed<O>> + Send + Sync + 'static,
    {
        TransformStage::Sync(Arc::new(f))
    }

    pub fn parallel(transformer: impl Transformer<I, O> + 'static, pool: WorkerPool) -> Self {
        TransformStage::Async(AsyncTransformer::new(Arc::new(transformer), pool))
    }

    /// Closure-friendly [`Self::parallel`].
    pub fn parallel_map<F>(f: F, pool: WorkerPool) -> Self
    where
        F: Fn(I) -> Result<Transformed<O>> + Send + Sync + 'static,
    {
        TransformStage::Async(AsyncTransformer::new(Arc::new(f), pool))
    }

    /// Shared handle to the underlying transformer (sync stages only).
    pub(crate) fn shared(&self) -> Option<Arc<dyn Transformer<I, O>>> {
        match self {
            TransformStage::Sync(t) => Some(Arc::clone(t)),
            TransformStage::Async(_) => None,
        }
    }
}

impl<T: Send + 'static> TransformStage<T, T> {
    /// No transformer: every record read is written as is.
    pub fn pass_through() -> Self {
        TransformStage::map(|item: T| Ok(Transformed::Item(item)))
    }
}

/// Records skipped so far in one step run. The workers of a multi-threaded step share one, so
/// the skip limit bounds the whole step rather than each worker.
#[derive(Debug, Default)]
pub(crate) struct SkipTally(AtomicUsize);

impl SkipTally {
    /// Claim one skip. Fails with the limit once `limit` skips were already claimed.
    fn claim(&self, limit: Option<usize>) -> std::result::Result<(), usize> {
        let Some(limit) = limit else {
            self.0.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| limit)
    }
}

/// Apply the error policy to one failed record. `Ok` means "skip it and continue".
fn on_transform_error(
    policy: TransformErrorPolicy,
    position: usize,
    source: anyhow::Error,
    skips: &SkipTally,
    ctx: &mut ExecutionContext,
) -> std::result::Result<(), StepError> {
    let chunk = ctx.chunk;
    match policy {
        TransformErrorPolicy::FailFast => Err(StepError::Transform {
            chunk,
            position,
            source,
        }),
        TransformErrorPolicy::Skip { limit } => {
            if let Err(limit) = skips.claim(limit) {
                return Err(StepError::SkipLimitExceeded {
                    chunk,
                    limit,
                    source,
                });
            }
            ctx.counts.skipped += 1;
            warn!(
                "[{}] skipping record {} of chunk {}: {:#}",
                ctx.step, position, chunk, source
            );
            Ok(())
        }
    }
}

/// Fold one record's outcome into the output chunk.
fn reconcile<O>(
    outcome: Result<Transformed<O>>,
    position: usize,
    policy: TransformErrorPolicy,
    skips: &SkipTally,
    out: &mut Vec<O>,
    ctx: &mut ExecutionContext,
) -> std::result::Result<(), StepError> {
    match outcome {
        Ok(Transformed::Item(o)) => out.push(o),
        Ok(Transformed::Filtered) => ctx.counts.filtered += 1,
        Err(e) => on_transform_error(policy, position, e, skips, ctx)?,
    }
    Ok(())
}

/// Transform a chunk. Output keeps read order; filtered and skipped records are removed.
pub(crate) fn transform_chunk<I, O>(
    stage: &TransformStage<I, O>,
    items: Vec<I>,
    policy: TransformErrorPolicy,
    skips: &SkipTally,
    ctx: &mut ExecutionContext,
) -> std::result::Result<Vec<O>, StepError>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let mut out = Vec::with_capacity(items.len());
    match stage {
        TransformStage::Sync(t) => {
            for (position, item) in items.into_iter().enumerate() {
                reconcile(t.transform(item), position, policy, skips, &mut out, ctx)?;
            }
        }
        TransformStage::Async(t) => {
            let pending = t.submit_all(items);
            for (position, p) in pending.into_iter().enumerate() {
                let outcome = p.wait().and_then(|r| r);
                reconcile(outcome, position, policy, skips, &mut out, ctx)?;
            }
        }
    }
    Ok(out)
}

/// Fold a finished write into the counts, or turn it into the step's fatal error.
pub(crate) fn apply_receipt(
    receipt: CommitReceipt,
    ctx: &mut ExecutionContext,
) -> std::result::Result<(), StepError> {
    let CommitReceipt {
        chunk,
        size,
        result,
    } = receipt;
    match result {
        Ok(persisted) => {
            ctx.counts.commits += 1;
            ctx.counts.written += size;
            ctx.counts.persisted += persisted;
            debug!(
                "[{}] chunk {} committed: {} written, {} persisted",
                ctx.step, chunk, size, persisted
            );
            Ok(())
        }
        Err(source) => Err(StepError::Commit {
            chunk,
            size,
            source,
        }),
    }
}
