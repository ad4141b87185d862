//! Sequential executor
//!
//! Runs the steps of an [`ExecutionPlan`] in order on one thread. Around
//! every kernel it drives the fence protocol of the values the node touches,
//! and after every step it releases the values whose lifetime ended there.
//! Asynchronous providers may still be working when the last step returns;
//! the executor synchronizes them before outputs are handed back.

pub mod context;
pub mod frame;

use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::graph::Graph;
use crate::kernel::OpKernel;
use crate::plan::ExecutionPlan;
use crate::provider::{ProviderTable, ProviderType, HOST_QUEUE_ID};
use crate::value::Value;

pub use context::{AsyncStatus, KernelContext};
pub use frame::{AllocationParams, BufferOwnership, ExecutionFrame};

/// Lifecycle of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Ready,
    Running { step: usize },
    Completed,
    Failed(String),
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Ready => f.write_str("ready"),
            ExecutionState::Running { step } => write!(f, "running step {}", step),
            ExecutionState::Completed => f.write_str("completed"),
            ExecutionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Executes a plan step by step
pub struct SequentialExecutor<'a> {
    graph: &'a Graph,
    plan: &'a ExecutionPlan,
    kernels: &'a [Box<dyn OpKernel>],
    providers: &'a ProviderTable,
    host_provider: ProviderType,
    debug: bool,
    state: ExecutionState,
}

impl<'a> SequentialExecutor<'a> {
    /// `kernels[i]` runs node `i` of `graph`
    pub fn new(
        graph: &'a Graph,
        plan: &'a ExecutionPlan,
        kernels: &'a [Box<dyn OpKernel>],
        providers: &'a ProviderTable,
    ) -> Self {
        Self {
            graph,
            plan,
            kernels,
            providers,
            host_provider: ProviderType::CPU,
            debug: false,
            state: ExecutionState::Ready,
        }
    }

    /// Log the shape of every output a node produces
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Run every step and return the fetched values, fence-free.
    ///
    /// `frame` must already hold the feeds and weights.
    pub fn execute(&mut self, frame: &mut ExecutionFrame, fetch_ids: &[usize]) -> ForgeResult<Vec<Value>> {
        if self.kernels.len() != self.graph.nodes().len() {
            return Err(ForgeError::InvalidPlan(format!(
                "{} kernels for {} nodes",
                self.kernels.len(),
                self.graph.nodes().len()
            )));
        }

        let status = AsyncStatus::new();
        let result = self
            .run_steps(frame, &status)
            .and_then(|()| self.providers.synchronize_all())
            .and_then(|()| status.check())
            .and_then(|()| self.collect(frame, fetch_ids));

        match result {
            Ok(values) => {
                self.state = ExecutionState::Completed;
                Ok(values)
            }
            Err(err) => {
                // Queued work may still reference frame buffers
                if let Err(sync_err) = self.providers.synchronize_all() {
                    tracing::warn!("Synchronize after failed run: {}", sync_err);
                }
                tracing::error!("Execution failed: {}", err);
                self.state = ExecutionState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    fn run_steps(&mut self, frame: &mut ExecutionFrame, status: &AsyncStatus) -> ForgeResult<()> {
        for (position, step) in self.plan.steps.iter().enumerate() {
            self.state = ExecutionState::Running { step: position };
            let node = self.graph.node(step.node_index);
            let provider_type = node.assigned_provider().ok_or_else(|| {
                ForgeError::InvalidPlan(format!("{} has no execution provider", node))
            })?;
            let queue_id = self.providers.require(provider_type)?.queue_id();

            tracing::trace!("Step {}: {} on {} (queue {})", position, node, provider_type, queue_id);

            let inputs: Vec<usize> = frame.node_input_ids(node.index()).iter().flatten().copied().collect();
            let outputs: Vec<usize> = frame.node_output_ids(node.index()).iter().flatten().copied().collect();

            for &id in &inputs {
                frame.value(id).fence().before_using_as_input(provider_type, queue_id)?;
            }
            // Outputs allocated before compute; fresh ones are fenced by the context
            for &id in &outputs {
                let value = frame.value(id);
                if value.is_allocated() {
                    value.fence().before_using_as_output(provider_type, queue_id)?;
                }
            }

            {
                let mut ctx = KernelContext::new(frame, node, provider_type, queue_id, status);
                self.kernels[node.index()]
                    .compute(&mut ctx)
                    .map_err(|e| e.in_node(node.node_name()))?;
            }

            if self.debug {
                for &id in &outputs {
                    if let Some(tensor) = frame.value(id).tensor() {
                        tracing::debug!(
                            "{} output #{}: {} {}",
                            node,
                            id,
                            tensor.dtype(),
                            tensor.shape()
                        );
                    }
                }
            }

            for &id in &inputs {
                frame.value(id).fence().after_used_as_input(queue_id)?;
            }
            for &id in &outputs {
                let value = frame.value(id);
                if value.is_allocated() {
                    value.fence().after_used_as_output(queue_id)?;
                }
            }

            for &id in &step.free_after {
                frame.release(id);
            }
        }
        Ok(())
    }

    fn collect(&self, frame: &ExecutionFrame, fetch_ids: &[usize]) -> ForgeResult<Vec<Value>> {
        fetch_ids
            .iter()
            .map(|&id| {
                let value = frame.value(id);
                if !value.is_allocated() {
                    return Err(ForgeError::Fail(format!(
                        "output value #{} was not produced",
                        id
                    )));
                }
                value
                    .fence()
                    .before_using_as_input(&self.host_provider, HOST_QUEUE_ID)?;
                Ok(frame.fetch(id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::graph::{Graph, Node};
    use crate::kernel::KernelDefBuilder;
    use crate::memory::AllocatorInfo;
    use crate::plan::{AllocationPlanner, ValueNameIdxMap};
    use crate::provider::cpu::CpuExecutionProvider;
    use crate::tensor::{DataType, Tensor};
    use crate::value::ValueType;

    /// Doubles its input and logs the node name
    struct Double(Arc<Mutex<Vec<String>>>);

    impl OpKernel for Double {
        fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
            self.0.lock().unwrap().push(ctx.node().node_name().to_string());
            let x = ctx.input(0);
            let data: Vec<f32> = x.to_vec::<f32>()?.iter().map(|v| v * 2.0).collect();
            let out = ctx.output(0, x.shape().clone())?;
            out.write_from(&data)
        }
    }

    struct Broken;

    impl OpKernel for Broken {
        fn compute(&self, _ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
            Err(ForgeError::Fail("boom".into()))
        }
    }

    struct Fixture {
        graph: Graph,
        values: ValueNameIdxMap,
        plan: ExecutionPlan,
        providers: Arc<ProviderTable>,
    }

    fn fixture() -> Fixture {
        let graph = Graph::builder("doubles")
            .input("x", ValueType::Tensor(DataType::F32))
            .output("y")
            .node(Node::new("Double").name("d1").input("x").output("a").provider(ProviderType::CPU))
            .node(Node::new("Double").name("d2").input("a").output("b").provider(ProviderType::CPU))
            .node(Node::new("Double").name("d3").input("b").output("y").provider(ProviderType::CPU))
            .build()
            .unwrap();
        let values = ValueNameIdxMap::new(&graph);
        let mut providers = ProviderTable::new();
        providers.add(Arc::new(CpuExecutionProvider::default())).unwrap();
        let defs = vec![KernelDefBuilder::new("Double").may_inplace(0, 0).build(); 3];
        let plan = AllocationPlanner::new(&graph, &values, &defs, &providers)
            .create_plan()
            .unwrap();
        Fixture {
            graph,
            values,
            plan,
            providers: Arc::new(providers),
        }
    }

    fn frame_with_feed(f: &Fixture) -> ExecutionFrame {
        let mut frame = ExecutionFrame::new(
            &f.graph,
            &f.values,
            Arc::clone(&f.plan.allocation_plan),
            Arc::clone(&f.providers),
        );
        let allocator = f.providers.allocator_for(&AllocatorInfo::cpu()).unwrap();
        let feed = Tensor::from_vec(allocator.as_ref(), [2], &[1.0f32, 2.0]).unwrap();
        frame
            .insert_preexisting(f.values.get("x").unwrap(), Value::from_tensor(feed))
            .unwrap();
        frame
    }

    #[test]
    fn test_runs_in_order() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let kernels: Vec<Box<dyn OpKernel>> = (0..3).map(|_| Box::new(Double(Arc::clone(&log))) as Box<dyn OpKernel>).collect();
        let mut frame = frame_with_feed(&f);
        let mut executor = SequentialExecutor::new(&f.graph, &f.plan, &kernels, &f.providers);

        let y = f.values.get("y").unwrap();
        let out = executor.execute(&mut frame, &[y]).unwrap();
        assert_eq!(out[0].tensor().unwrap().to_vec::<f32>().unwrap(), vec![8.0, 16.0]);
        assert_eq!(*log.lock().unwrap(), vec!["d1", "d2", "d3"]);
        assert_eq!(executor.state(), &ExecutionState::Completed);

        // Intermediates were released after their last use
        assert!(!frame.value(f.values.get("a").unwrap()).is_allocated());
        assert!(!frame.value(f.values.get("b").unwrap()).is_allocated());
    }

    #[test]
    fn test_kernel_error_names_node() {
        let f = fixture();
        let log = Arc::new(Mutex::new(Vec::new()));
        let kernels: Vec<Box<dyn OpKernel>> = vec![
            Box::new(Double(Arc::clone(&log))),
            Box::new(Broken),
            Box::new(Double(Arc::clone(&log))),
        ];
        let mut frame = frame_with_feed(&f);
        let mut executor = SequentialExecutor::new(&f.graph, &f.plan, &kernels, &f.providers);

        let err = executor
            .execute(&mut frame, &[f.values.get("y").unwrap()])
            .unwrap_err();
        assert!(matches!(err, ForgeError::KernelFailed { ref node, .. } if node == "d2"));
        assert!(matches!(executor.state(), ExecutionState::Failed(_)));
        assert_eq!(*log.lock().unwrap(), vec!["d1"]);
    }

    #[test]
    fn test_kernel_count_mismatch() {
        let f = fixture();
        let kernels: Vec<Box<dyn OpKernel>> = vec![Box::new(Broken)];
        let mut frame = frame_with_feed(&f);
        let mut executor = SequentialExecutor::new(&f.graph, &f.plan, &kernels, &f.providers);
        assert!(matches!(
            executor.execute(&mut frame, &[]),
            Err(ForgeError::InvalidPlan(_))
        ));
        assert_eq!(executor.state(), &ExecutionState::Ready);
    }
}
