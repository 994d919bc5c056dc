//! Per-record transformers and the policy applied when one fails.

use anyhow::Result;

/// Output of a transformer: a new record, or `Filtered` to drop it from the chunk.
/// A filtered record counts as read but not as written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transformed<T> {
    Item(T),
    Filtered,
}

/// Pure mapping from one record to the next. Takes the record by value and returns a new one,
/// so the same transformer can run on several workers without sharing mutable records.
pub trait Transformer<I, O>: Send + Sync {
    fn transform(&self, item: I) -> Result<Transformed<O>>;
}

impl<I, O, F> Transformer<I, O> for F
where
    F: Fn(I) -> Result<Transformed<O>> + Send + Sync,
{
    fn transform(&self, item: I) -> Result<Transformed<O>> {
        self(item)
    }
}

/// What a step does when `transform` returns an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformErrorPolicy {
    /// Abandon the chunk and fail the step.
    #[default]
    FailFast,
    /// Drop the record, count it as skipped, keep going. Exceeding `limit` skips in one step run
    /// is fatal, summed over all workers of a multi-threaded step; `None` means unlimited.
    Skip { limit: Option<usize> },
}
