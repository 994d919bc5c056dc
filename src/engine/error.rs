//! Step failure taxonomy. Every variant is fatal to the step that raised it.

use std::error::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    /// Chunk size or worker count was invalid. Raised before any read.
    #[error("invalid step configuration: {0}")]
    Config(String),

    /// Opening the source or committer failed: connection, query/bind mismatch or reader thread.
    #[error("failed to acquire step resources")]
    Resource(#[source] anyhow::Error),

    #[error("source failed after {read} records")]
    Source {
        read: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("transform failed on record {position} of chunk {chunk}")]
    Transform {
        chunk: usize,
        position: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("skip limit of {limit} exceeded in chunk {chunk}")]
    SkipLimitExceeded {
        chunk: usize,
        limit: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The chunk's transaction was rolled back; none of its records persisted.
    #[error("commit of chunk {chunk} ({size} records) rolled back")]
    Commit {
        chunk: usize,
        size: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("tasklet failed")]
    Tasklet(#[source] anyhow::Error),

    #[error("worker {name} panicked: {message}")]
    WorkerPanicked { name: String, message: String },
}

/// Render an error and its sources as one line: `outer: inner: root`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}

/// Best-effort message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
