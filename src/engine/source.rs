//! Item sources: the record stream a step reads from.

use anyhow::Result;

/// A lazy, finite stream of records. `read` returns `Ok(None)` at end of stream, and every
/// call after that must return `Ok(None)` as well.
///
/// Not required to be safe for concurrent callers: `read` takes `&mut self`. Wrap in
/// [`SynchronizedSource`](super::SynchronizedSource) to share one source among worker threads.
pub trait ItemSource: Send {
    type Item: Send + 'static;

    /// Acquire resources (connection, reader thread). Called once when the step starts.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Self::Item>>;

    /// Release resources. Called when the step ends, on success or failure.
    fn close(&mut self) {}
}

impl<S: ItemSource + ?Sized> ItemSource for Box<S> {
    type Item = S::Item;

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read(&mut self) -> Result<Option<Self::Item>> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A source shared by several worker threads. `read` takes `&self`; implementations serialize
/// access internally.
pub trait ConcurrentSource: Send + Sync {
    type Item: Send + 'static;

    fn open(&self) -> Result<()>;

    fn read(&self) -> Result<Option<Self::Item>>;

    fn close(&self);
}

/// In-memory source over an owned list. Useful for tasklet-fed steps and tests.
pub struct ListSource<T> {
    items: std::iter::Fuse<std::vec::IntoIter<T>>,
}

impl<T> ListSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter().fuse(),
        }
    }
}

impl<T: Send + 'static> ItemSource for ListSource<T> {
    type Item = T;

    fn read(&mut self) -> Result<Option<T>> {
        Ok(self.items.next())
    }
}
