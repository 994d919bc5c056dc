//! passbatch: chunk-oriented batch engine (sources, transformers, committers, steps, flows,
//! jobs) and the pass/booking jobs built on it.

pub mod cli;
pub mod engine;
pub mod jobs;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use engine::{ChunkStep, ConcurrentChunkStep, Executable, StepConfig, StepError, TaskletStep};
pub use pipeline::{Flow, FlowNode, Job, JobParams, JobRegistry};

/// Result alias used by the public passbatch API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
