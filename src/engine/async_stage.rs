//! Worker-pool wrappers that promote a transformer or committer to a concurrent stage.
//!
//! Each submitted task gets its own one-shot channel ([`Pending`]); the step resolves pendings
//! in submission order, so results are reconciled positionally regardless of which worker
//! finished first.

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, bounded};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::committer::Committer;
use super::error::panic_message;
use super::transform::{Transformed, Transformer};

/// Fixed-size pool of named worker threads.
pub struct WorkerPool {
    name: String,
    size: usize,
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!("worker pool {name}: size must be > 0"));
        }
        let thread_prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |i| format!("{thread_prefix}-{i}"))
            .build()
            .with_context(|| format!("build worker pool {name}"))?;
        Ok(Self {
            name: name.to_string(),
            size,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` on the pool. A panic inside the task is caught and surfaces from
    /// [`Pending::wait`] instead of tearing down the pool.
    pub fn submit<T, F>(&self, task: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.pool.spawn(move || {
            let out = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| panic_message(payload.as_ref()));
            // Receiver dropped means the step abandoned this chunk.
            let _ = tx.send(out);
        });
        Pending {
            rx,
            pool: self.name.clone(),
        }
    }
}

/// Result slot for one submitted task.
pub struct Pending<T> {
    rx: Receiver<std::result::Result<T, String>>,
    pool: String,
}

impl<T> Pending<T> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(msg)) => Err(anyhow!("task on pool {} panicked: {msg}", self.pool)),
            Err(_) => Err(anyhow!("task on pool {} dropped its result", self.pool)),
        }
    }
}

/// Dispatches every record of a chunk to a worker pool, one [`Pending`] per record.
pub struct AsyncTransformer<I, O> {
    delegate: Arc<dyn Transformer<I, O>>,
    pool: WorkerPool,
}

impl<I, O> AsyncTransformer<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(delegate: Arc<dyn Transformer<I, O>>, pool: WorkerPool) -> Self {
        Self { delegate, pool }
    }

    pub fn submit(&self, item: I) -> Pending<Result<Transformed<O>>> {
        let delegate = Arc::clone(&self.delegate);
        self.pool.submit(move || delegate.transform(item))
    }

    /// Submit a whole chunk; the returned pendings are in the chunk's read order.
    pub fn submit_all(&self, items: Vec<I>) -> Vec<Pending<Result<Transformed<O>>>> {
        items.into_iter().map(|item| self.submit(item)).collect()
    }
}

/// Outcome of one asynchronous chunk write.
pub struct CommitReceipt {
    pub chunk: usize,
    pub size: usize,
    pub result: Result<usize>,
}

type Handoff<O> = (Box<dyn Committer<O>>, Result<usize>);

struct InFlight<O> {
    chunk: usize,
    size: usize,
    pending: Pending<Handoff<O>>,
}

/// Writes chunks on a worker pool so the step can read and transform the next chunk meanwhile.
///
/// At most one write is in flight: the committer itself is moved into the task and handed back
/// on resolution, so commits stay in read order without a lock.
pub struct AsyncCommitter<O> {
    committer: Option<Box<dyn Committer<O>>>,
    in_flight: Option<InFlight<O>>,
    pool: WorkerPool,
}

impl<O: Send + 'static> AsyncCommitter<O> {
    pub fn new(committer: Box<dyn Committer<O>>, pool: WorkerPool) -> Self {
        Self {
            committer: Some(committer),
            in_flight: None,
            pool,
        }
    }

    fn idle(&mut self) -> Result<&mut Box<dyn Committer<O>>> {
        if self.in_flight.is_some() {
            return Err(anyhow!("async committer busy: previous chunk not resolved"));
        }
        self.committer
            .as_mut()
            .ok_or_else(|| anyhow!("async committer lost its delegate after a worker panic"))
    }

    pub fn open(&mut self) -> Result<()> {
        self.idle()?.open()
    }

    pub fn close(&mut self) {
        if let Some(receipt) = self.resolve() {
            log::warn!(
                "async committer closed with chunk {} still in flight",
                receipt.chunk
            );
        }
        if let Some(c) = self.committer.as_mut() {
            c.close();
        }
    }

    /// Start writing `chunk`. Fails if the previous write has not been resolved.
    pub fn submit(&mut self, chunk_no: usize, chunk: Vec<O>) -> Result<()> {
        self.idle()?;
        let Some(mut committer) = self.committer.take() else {
            return Err(anyhow!("async committer has no delegate"));
        };
        let size = chunk.len();
        let pending = self.pool.submit(move || {
            let result = committer.commit(chunk);
            (committer, result)
        });
        self.in_flight = Some(InFlight {
            chunk: chunk_no,
            size,
            pending,
        });
        Ok(())
    }

    /// Wait for the in-flight write, if any.
    pub fn resolve(&mut self) -> Option<CommitReceipt> {
        let InFlight {
            chunk,
            size,
            pending,
        } = self.in_flight.take()?;
        let result = match pending.wait() {
            Ok((committer, result)) => {
                self.committer = Some(committer);
                result
            }
            Err(e) => Err(e),
        };
        Some(CommitReceipt {
            chunk,
            size,
            result,
        })
    }
}
