//! Chunk committers: persist one chunk as one atomic unit.

use anyhow::Result;

/// Writes a whole chunk atomically: either every record is persisted or none are.
/// Returns how many records were durably changed.
pub trait Committer<T>: Send {
    /// Acquire resources (connection). Called once when the step (or worker) starts.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called exactly once per chunk read, possibly with an empty chunk when every record in it
    /// was filtered or skipped.
    fn commit(&mut self, chunk: Vec<T>) -> Result<usize>;

    fn close(&mut self) {}
}

impl<T, F> Committer<T> for F
where
    F: FnMut(Vec<T>) -> Result<usize> + Send,
{
    fn commit(&mut self, chunk: Vec<T>) -> Result<usize> {
        self(chunk)
    }
}
