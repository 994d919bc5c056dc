//! Mutual-exclusion gate around a non-thread-safe source.
//!
//! The lock is held for exactly one `read` of the underlying source, never across a transform
//! or commit, so workers only serialize on the cheap part of the pipeline.

use anyhow::{Result, anyhow};
use std::sync::Mutex;

use super::source::{ConcurrentSource, ItemSource};

struct Gate<S> {
    source: S,
    exhausted: bool,
}

/// Shares one ordered [`ItemSource`] (typically a cursor) among worker threads.
///
/// Records are handed out in the source's natural order, one per `read`, never duplicated or
/// dropped. Once end of stream is seen it is latched, so late callers don't touch the source.
pub struct SynchronizedSource<S: ItemSource> {
    gate: Mutex<Gate<S>>,
}

impl<S: ItemSource> SynchronizedSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            gate: Mutex::new(Gate {
                source,
                exhausted: false,
            }),
        }
    }

    fn with_gate<R>(&self, f: impl FnOnce(&mut Gate<S>) -> Result<R>) -> Result<R> {
        let mut gate = self
            .gate
            .lock()
            .map_err(|_| anyhow!("synchronized source lock poisoned"))?;
        f(&mut gate)
    }
}

fn read_gate<S: ItemSource>(gate: &mut Gate<S>) -> Result<Option<S::Item>> {
    if gate.exhausted {
        return Ok(None);
    }
    let next = gate.source.read()?;
    if next.is_none() {
        gate.exhausted = true;
    }
    Ok(next)
}

impl<S: ItemSource> ConcurrentSource for SynchronizedSource<S> {
    type Item = S::Item;

    fn open(&self) -> Result<()> {
        self.with_gate(|g| {
            g.exhausted = false;
            g.source.open()
        })
    }

    fn read(&self) -> Result<Option<S::Item>> {
        self.with_gate(|g| read_gate(g))
    }

    fn close(&self) {
        if let Err(e) = self.with_gate(|g| {
            g.source.close();
            Ok(())
        }) {
            log::warn!("closing synchronized source: {e}");
        }
    }
}

/// Exclusive access needs no lock.
impl<S: ItemSource> ItemSource for SynchronizedSource<S> {
    type Item = S::Item;

    fn open(&mut self) -> Result<()> {
        let gate = self
            .gate
            .get_mut()
            .map_err(|_| anyhow!("synchronized source lock poisoned"))?;
        gate.exhausted = false;
        gate.source.open()
    }

    fn read(&mut self) -> Result<Option<S::Item>> {
        let gate = self
            .gate
            .get_mut()
            .map_err(|_| anyhow!("synchronized source lock poisoned"))?;
        read_gate(gate)
    }

    fn close(&mut self) {
        if let Ok(gate) = self.gate.get_mut() {
            gate.source.close();
        }
    }
}
