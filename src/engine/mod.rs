//! Chunk-oriented execution engine: sources, transformers, committers and the step drivers.

pub mod async_stage;
pub mod chunk;
pub mod committer;
pub mod concurrent_step;
pub mod error;
pub mod source;
pub mod step;
pub mod synchronized;
pub mod tasklet;
pub mod transform;

// Re-export commonly used types
pub use async_stage::{AsyncCommitter, AsyncTransformer, CommitReceipt, Pending, WorkerPool};
pub use chunk::TransformStage;
pub use committer::Committer;
pub use concurrent_step::{CommitterFactory, ConcurrentChunkStep};
pub use error::StepError;
pub use source::{ConcurrentSource, ItemSource, ListSource};
pub use step::{ChunkStep, CommitStage, Executable, StepConfig};
pub use synchronized::SynchronizedSource;
pub use tasklet::{Tasklet, TaskletStep};
pub use transform::{TransformErrorPolicy, Transformed, Transformer};
