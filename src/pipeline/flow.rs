//! Flow composition: sequential chains and parallel splits of steps and sub-flows.

use log::{info, warn};
use std::thread;

use crate::engine::error::panic_message;
use crate::engine::{Executable, StepError};
use crate::{BatchStatus, FlowResult, Outcome, StepResult};

/// One element of a sequential flow.
pub enum FlowNode {
    Step(Box<dyn Executable>),
    Flow(Flow),
}

impl FlowNode {
    pub fn step(step: impl Executable + 'static) -> Self {
        FlowNode::Step(Box::new(step))
    }

    fn name(&self) -> &str {
        match self {
            FlowNode::Step(s) => s.name(),
            FlowNode::Flow(f) => f.name(),
        }
    }

    fn execute(&mut self) -> Outcome {
        match self {
            FlowNode::Step(s) => Outcome::Step(s.execute()),
            FlowNode::Flow(f) => Outcome::Flow(f.execute()),
        }
    }
}

impl From<Flow> for FlowNode {
    fn from(flow: Flow) -> Self {
        FlowNode::Flow(flow)
    }
}

enum FlowKind {
    /// Children in order; halts at the first failure.
    Sequential(Vec<FlowNode>),
    /// Every branch on its own thread; waits for all, no cross-branch cancellation.
    Parallel(Vec<Flow>),
}

pub struct Flow {
    name: String,
    kind: FlowKind,
}

impl Flow {
    pub fn sequential(name: &str, nodes: Vec<FlowNode>) -> Self {
        Self {
            name: name.to_string(),
            kind: FlowKind::Sequential(nodes),
        }
    }

    /// A flow that runs one step.
    pub fn single(name: &str, step: impl Executable + 'static) -> Self {
        Self::sequential(name, vec![FlowNode::step(step)])
    }

    pub fn parallel(name: &str, branches: Vec<Flow>) -> Self {
        Self {
            name: name.to_string(),
            kind: FlowKind::Parallel(branches),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, FlowKind::Parallel(_))
    }

    pub fn execute(&mut self) -> FlowResult {
        let (parallel, children) = match &mut self.kind {
            FlowKind::Sequential(nodes) => (false, run_sequential(&self.name, nodes)),
            FlowKind::Parallel(branches) => (true, run_parallel(&self.name, branches)),
        };
        let status = if children.iter().any(|c| c.status().is_failed()) {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        info!("Flow [{}] {}", self.name, status.as_str());
        FlowResult {
            name: self.name.clone(),
            parallel,
            status,
            children,
        }
    }
}

fn run_sequential(flow: &str, nodes: &mut [FlowNode]) -> Vec<Outcome> {
    let mut children = Vec::with_capacity(nodes.len());
    let mut iter = nodes.iter_mut();
    for node in iter.by_ref() {
        let outcome = node.execute();
        let failed = outcome.status().is_failed();
        children.push(outcome);
        if failed {
            break;
        }
    }
    let skipped: Vec<&str> = iter.map(|n| n.name()).collect();
    if !skipped.is_empty() {
        warn!(
            "Flow [{}] stopped at first failure; not started: {}",
            flow,
            skipped.join(", ")
        );
    }
    children
}

fn run_parallel(flow: &str, branches: &mut [Flow]) -> Vec<Outcome> {
    info!("Flow [{}] splitting into {} branches", flow, branches.len());
    thread::scope(|scope| {
        let handles: Vec<_> = branches
            .iter_mut()
            .map(|branch| {
                let name = branch.name.clone();
                let handle = thread::Builder::new()
                    .name(format!("flow-{name}"))
                    .spawn_scoped(scope, move || branch.execute());
                (name, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, handle)| match handle {
                Ok(h) => match h.join() {
                    Ok(result) => Outcome::Flow(result),
                    Err(payload) => Outcome::Step(StepResult::failed(
                        &name,
                        StepError::WorkerPanicked {
                            name: name.clone(),
                            message: panic_message(payload.as_ref()),
                        },
                    )),
                },
                Err(e) => Outcome::Step(StepResult::failed(
                    &name,
                    StepError::Resource(anyhow::Error::new(e).context("spawn branch thread")),
                )),
            })
            .collect()
    })
}
