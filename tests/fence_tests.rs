//! Fence protocol tests
//!
//! A recording provider claims to be asynchronous so the planner fences
//! every value it shares with the CPU. Its fences log each hook call; the
//! tests check the order in which the executor drives them.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use graphforge::executor::KernelContext;
use graphforge::kernel::OpKernelInfo;
use graphforge::memory::{AllocatorKind, AllocatorPtr, ArenaAllocator, MemType};
use graphforge::ops::{unary_into, UnaryOp};
use graphforge::provider::{ExecutionProvider, Fence, FencePtr, ProviderPtr};
use graphforge::{
    AllocatorInfo, DataType, ForgeResult, Graph, InferenceSession, KernelDefBuilder, KernelRegistry, Node,
    OpKernel, ProviderType, SessionOptions, ValueType,
};

const RECORDING_QUEUE: usize = 7;

fn recording_type() -> ProviderType {
    ProviderType::new("RecordingExecutionProvider")
}

type Log = Arc<Mutex<Vec<(usize, String)>>>;

/// Fence appending `(fence id, hook)` to a shared log
#[derive(Debug)]
struct RecordingFence {
    id: usize,
    log: Log,
}

impl RecordingFence {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push((self.id, entry));
    }
}

impl Fence for RecordingFence {
    fn before_using_as_input(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()> {
        self.push(format!("before_input {} {}", provider, queue_id));
        Ok(())
    }

    fn before_using_as_output(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()> {
        self.push(format!("before_output {} {}", provider, queue_id));
        Ok(())
    }

    fn after_used_as_input(&self, queue_id: usize) -> ForgeResult<()> {
        self.push(format!("after_input {}", queue_id));
        Ok(())
    }

    fn after_used_as_output(&self, queue_id: usize) -> ForgeResult<()> {
        self.push(format!("after_output {}", queue_id));
        Ok(())
    }
}

struct RecordingRelu;

impl OpKernel for RecordingRelu {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let out = ctx.output(0, x.shape().clone())?;
        unary_into(UnaryOp::Relu, &x, &out)
    }
}

/// Host-memory provider that reports itself as asynchronous
#[derive(Debug)]
struct RecordingProvider {
    provider_type: ProviderType,
    allocator: AllocatorPtr,
    registry: Arc<KernelRegistry>,
    next_fence: AtomicUsize,
    log: Log,
}

impl RecordingProvider {
    fn new(log: Log) -> Self {
        let provider_type = recording_type();
        let mut registry = KernelRegistry::new();
        registry
            .register_fn(
                KernelDefBuilder::new("Relu")
                    .since_version(6)
                    .provider(provider_type.clone())
                    .type_constraint("T", [DataType::F32])
                    .build(),
                |_: &OpKernelInfo| Ok(Box::new(RecordingRelu) as Box<dyn OpKernel>),
            )
            .unwrap();
        Self {
            provider_type,
            allocator: Arc::new(ArenaAllocator::new(AllocatorInfo::new(
                "Recording",
                AllocatorKind::Arena,
                0,
                MemType::Default,
            ))),
            registry: Arc::new(registry),
            next_fence: AtomicUsize::new(0),
            log,
        }
    }
}

impl ExecutionProvider for RecordingProvider {
    fn provider_type(&self) -> &ProviderType {
        &self.provider_type
    }

    fn allocator(&self, mem_type: MemType) -> Option<AllocatorPtr> {
        (mem_type == MemType::Default).then(|| Arc::clone(&self.allocator))
    }

    fn allocators(&self) -> Vec<AllocatorPtr> {
        vec![Arc::clone(&self.allocator)]
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry> {
        Arc::clone(&self.registry)
    }

    fn queue_id(&self) -> usize {
        RECORDING_QUEUE
    }

    fn is_async(&self) -> bool {
        true
    }

    fn create_fence(&self) -> FencePtr {
        Arc::new(RecordingFence {
            id: self.next_fence.fetch_add(1, Ordering::SeqCst),
            log: Arc::clone(&self.log),
        })
    }
}

/// `x` (host) -> Relu on the recording provider -> `a` -> Sigmoid on CPU -> `y`
fn mixed_graph() -> Graph {
    Graph::builder("mixed")
        .input("x", ValueType::Tensor(DataType::F32))
        .node(Node::new("Relu").name("relu").input("x").output("a").provider(recording_type()))
        .node(Node::new("Sigmoid").name("sigmoid").input("a").output("y").provider(ProviderType::CPU))
        .output("y")
        .build()
        .unwrap()
}

fn entries_of(log: &Log, fence: usize) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == fence)
        .map(|(_, entry)| entry.clone())
        .collect()
}

fn recording_session(log: &Log) -> InferenceSession {
    session_with(
        mixed_graph(),
        SessionOptions::new().with_logid("fences"),
        vec![Arc::new(RecordingProvider::new(Arc::clone(log))) as ProviderPtr],
    )
}

#[test]
fn test_shared_values_are_fenced() {
    let log: Log = Arc::default();
    let session = recording_session(&log);
    let state = session.state().unwrap();
    let plan = &state.plan().allocation_plan;
    let entry = |name: &str| plan.entry(state.value_map().get(name).unwrap()).clone();

    assert!(entry("x").create_fence);
    assert_eq!(entry("x").fence_provider, Some(recording_type()));
    assert!(entry("a").create_fence);
    // Produced and read back on the host only
    assert!(!entry("y").create_fence);
}

#[test]
fn test_fence_call_order() {
    let log: Log = Arc::default();
    let session = recording_session(&log);
    let outputs = session.run(&feed(&session, [3], &[-1.0, 0.0, 2.0]), &["y"]).unwrap();
    assert_close(&f32_output(&outputs, 0), &[0.5, 0.5, sigmoid(2.0)], 1e-6);

    let cpu = ProviderType::CPU;
    let rec = recording_type();

    // Fence 0 belongs to the feed `x`, created when it entered the frame
    assert_eq!(
        entries_of(&log, 0),
        vec![
            format!("before_input {} {}", rec, RECORDING_QUEUE),
            format!("after_input {}", RECORDING_QUEUE),
        ]
    );
    // Fence 1 belongs to `a`: written on the recording queue, then read by the CPU
    assert_eq!(
        entries_of(&log, 1),
        vec![
            format!("before_output {} {}", rec, RECORDING_QUEUE),
            format!("after_output {}", RECORDING_QUEUE),
            format!("before_input {} 0", cpu),
            "after_input 0".to_string(),
        ]
    );
}

#[test]
fn test_every_run_gets_fresh_fences() {
    let log: Log = Arc::default();
    let session = recording_session(&log);
    for _ in 0..3 {
        session.run(&feed(&session, [1], &[1.0]), &["y"]).unwrap();
    }
    let fences: std::collections::BTreeSet<usize> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
    assert_eq!(fences.len(), 6);
}
