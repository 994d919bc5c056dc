//! Composition above the step: flows, jobs, and the job registry.

pub mod flow;
pub mod job;

pub use flow::{Flow, FlowNode};
pub use job::{Job, JobHandle, JobParams, JobRegistry, parse_datetime};
