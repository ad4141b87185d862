//! Graph, session and tensor fixtures shared by the integration tests

use std::collections::HashMap;
use std::sync::Arc;

use graphforge::graph::demo;
use graphforge::provider::ProviderPtr;
use graphforge::{
    CpuExecutionProvider, CpuProviderConfig, DataType, Graph, InferenceSession, Node, ProviderType,
    SessionOptions, StreamExecutionProvider, StreamProviderConfig, Tensor, Value, ValueType,
};

// ============================================================================
// Graphs
// ============================================================================

/// `y = sigmoid(relu(2 * x))`, every node in-place capable on the CPU
pub fn chain_graph() -> Graph {
    Graph::builder("chain")
        .input("x", ValueType::Tensor(DataType::F32))
        .node(Node::new("Scale").name("scale").input("x").output("a").attr("scale", 2.0f32))
        .node(Node::new("Relu").name("relu").input("a").output("b"))
        .node(Node::new("Sigmoid").name("sigmoid").input("b").output("y"))
        .output("y")
        .build()
        .expect("chain graph")
}

/// Demo perceptron with 4 inputs, 8 hidden units and 3 outputs
pub fn mlp_graph() -> Graph {
    demo::mlp(4, 8, 3).expect("mlp graph")
}

// ============================================================================
// Sessions
// ============================================================================

pub fn cpu_provider() -> Arc<CpuExecutionProvider> {
    Arc::new(CpuExecutionProvider::new(CpuProviderConfig::new()).expect("cpu provider"))
}

pub fn stream_provider() -> Arc<StreamExecutionProvider> {
    Arc::new(StreamExecutionProvider::new(StreamProviderConfig::new()).expect("stream provider"))
}

/// Initialized session over `providers` (CPU is added implicitly if absent)
pub fn session_with(graph: Graph, options: SessionOptions, providers: Vec<ProviderPtr>) -> InferenceSession {
    let mut session = InferenceSession::new(options);
    for provider in providers {
        session
            .register_execution_provider(provider)
            .expect("register provider");
    }
    session.load(graph).expect("load graph");
    session.initialize().expect("initialize session");
    session
}

pub fn cpu_session(graph: Graph) -> InferenceSession {
    session_with(graph, SessionOptions::new().with_logid("test-cpu"), Vec::new())
}

/// Session preferring the stream provider, falling back to the CPU
pub fn stream_session(graph: Graph) -> InferenceSession {
    let options = SessionOptions::new()
        .with_logid("test-stream")
        .with_provider_priority([ProviderType::STREAM, ProviderType::CPU]);
    session_with(graph, options, vec![stream_provider() as ProviderPtr, cpu_provider() as ProviderPtr])
}

// ============================================================================
// Tensors
// ============================================================================

/// Host tensor allocated from the session's CPU allocator
pub fn host_tensor<const N: usize>(session: &InferenceSession, shape: [usize; N], data: &[f32]) -> Tensor {
    let allocator = session.host_allocator().expect("host allocator");
    Tensor::from_vec(allocator.as_ref(), shape, data).expect("host tensor")
}

/// Feeds holding `x` only
pub fn feed<const N: usize>(session: &InferenceSession, shape: [usize; N], data: &[f32]) -> HashMap<String, Value> {
    HashMap::from([(
        "x".to_string(),
        Value::from_tensor(host_tensor(session, shape, data)),
    )])
}

/// Output `index` read back as `f32`
pub fn f32_output(outputs: &[Value], index: usize) -> Vec<f32> {
    outputs[index]
        .tensor()
        .expect("tensor output")
        .to_vec::<f32>()
        .expect("f32 output")
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {}: got {}, expected {} (tolerance {})",
            i,
            a,
            e,
            tolerance
        );
    }
}
