//! Small built-in graphs used by the CLI and the bench

use crate::error::ForgeResult;
use crate::graph::{Graph, Node};
use crate::tensor::DataType;
use crate::value::ValueType;

/// Deterministic weights in `[-0.5, 0.5]`
fn weights(count: usize, seed: usize) -> Vec<f32> {
    (0..count)
        .map(|i| ((i * 7 + seed * 13) % 11) as f32 / 10.0 - 0.5)
        .collect()
}

/// Two-layer perceptron `sigmoid(relu(x·w1 + b1)·w2 + b2)`
///
/// Input `x` is `[batch, input_dim]`, output `y` is `[batch, classes]`.
pub fn mlp(input_dim: usize, hidden: usize, classes: usize) -> ForgeResult<Graph> {
    Graph::builder("demo_mlp")
        .input("x", ValueType::Tensor(DataType::F32))
        .initializer("w1", [input_dim, hidden], &weights(input_dim * hidden, 1))
        .initializer("b1", [hidden], &weights(hidden, 2))
        .initializer("w2", [hidden, classes], &weights(hidden * classes, 3))
        .initializer("b2", [classes], &weights(classes, 4))
        .node(Node::new("MatMul").name("fc1").inputs(["x", "w1"]).output("h1"))
        .node(Node::new("Add").name("bias1").inputs(["h1", "b1"]).output("h1b"))
        .node(Node::new("Relu").name("act1").input("h1b").output("a1"))
        .node(Node::new("MatMul").name("fc2").inputs(["a1", "w2"]).output("h2"))
        .node(Node::new("Add").name("bias2").inputs(["h2", "b2"]).output("logits"))
        .node(Node::new("Sigmoid").name("prob").input("logits").output("y"))
        .output("y")
        .build()
}
