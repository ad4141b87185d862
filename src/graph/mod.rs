//! Dataflow graph model
//!
//! Graphs are built in memory through [`GraphBuilder`]. `build()` validates
//! the graph (single producer per value, every input defined, every output
//! produced, no cycles), computes a deterministic topological order, and
//! infers the type bindings and output types of every node.
//!
//! # Example
//!
//! ```ignore
//! let graph = Graph::builder("mlp")
//!     .input("x", ValueType::Tensor(DataType::F32))
//!     .initializer("w", [4, 4], &weights)
//!     .node(Node::new("MatMul").inputs(["x", "w"]).outputs(["h"]))
//!     .node(Node::new("Relu").inputs(["h"]).outputs(["y"]))
//!     .output("y")
//!     .build()?;
//! ```

pub mod attribute;
pub mod demo;
pub mod partition;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::provider::ProviderType;
use crate::tensor::{DataType, TensorElement, TensorShape};
use crate::value::ValueType;

pub use attribute::{AttributeValue, Attributes};
pub use partition::{partition, PartitionOptions};

/// Default operator domain
pub const DEFAULT_DOMAIN: &str = "";
/// Classical machine-learning operator domain
pub const ML_DOMAIN: &str = "ml";
/// Domain of nodes inserted by graphforge itself (copies)
pub const INTERNAL_DOMAIN: &str = "graphforge";

/// Opset version used for a domain that the graph does not import explicitly
pub fn default_opset(domain: &str) -> u32 {
    match domain {
        DEFAULT_DOMAIN => 13,
        _ => 1,
    }
}

/// Declared type and (optional) static shape of a value
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub value_type: ValueType,
    pub shape: Option<TensorShape>,
}

impl ValueInfo {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            shape: None,
        }
    }

    pub fn with_shape(mut self, shape: impl Into<TensorShape>) -> Self {
        self.shape = Some(shape.into());
        self
    }
}

/// Constant tensor data (a weight) stored with the graph
#[derive(Debug, Clone, PartialEq)]
pub struct InitializerData {
    pub dtype: DataType,
    pub shape: TensorShape,
    pub bytes: Vec<u8>,
}

impl InitializerData {
    pub fn from_slice<T: TensorElement>(shape: impl Into<TensorShape>, data: &[T]) -> ForgeResult<Self> {
        let shape = shape.into();
        if shape.size() != data.len() {
            return Err(ForgeError::InvalidGraph(format!(
                "initializer shape {} holds {} elements, got {}",
                shape,
                shape.size(),
                data.len()
            )));
        }
        let width = T::DTYPE.size();
        let mut bytes = vec![0u8; width * data.len()];
        for (chunk, value) in bytes.chunks_exact_mut(width).zip(data) {
            value.write_le(chunk);
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            bytes,
        })
    }
}

/// A node: one operator invocation
///
/// An empty input name marks an omitted optional input.
#[derive(Debug, Clone)]
pub struct Node {
    index: usize,
    name: String,
    op_type: String,
    domain: String,
    version: u32,
    attributes: Attributes,
    inputs: Vec<String>,
    outputs: Vec<String>,
    type_bindings: BTreeMap<String, DataType>,
    provider: Option<ProviderType>,
}

impl Node {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            index: 0,
            name: String::new(),
            op_type: op_type.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            version: 0,
            attributes: Attributes::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            type_bindings: BTreeMap::new(),
            provider: None,
        }
    }

    // ========== Builder ==========

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Pin the opset version (otherwise taken from the graph's imports)
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Bind a type parameter explicitly (e.g. `T` → f32)
    pub fn bind_type(mut self, param: impl Into<String>, dtype: DataType) -> Self {
        self.type_bindings.insert(param.into(), dtype);
        self
    }

    /// Force the node onto a provider
    pub fn provider(mut self, provider: ProviderType) -> Self {
        self.provider = Some(provider);
        self
    }

    // ========== Accessors ==========

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node_name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn op_domain(&self) -> &str {
        &self.domain
    }

    /// Opset version the node was built against
    pub fn since_version(&self) -> u32 {
        self.version
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Input names in argument order; `None` for an omitted optional input
    pub fn input_defs(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        self.inputs
            .iter()
            .map(|s| if s.is_empty() { None } else { Some(s.as_str()) })
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn type_bindings(&self) -> &BTreeMap<String, DataType> {
        &self.type_bindings
    }

    pub fn assigned_provider(&self) -> Option<&ProviderType> {
        self.provider.as_ref()
    }

    pub(crate) fn set_provider(&mut self, provider: ProviderType) {
        self.provider = Some(provider);
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut Vec<String> {
        &mut self.inputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut Vec<String> {
        &mut self.outputs
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{} ({}:{})", self.name, self.op_type, self.version)
        } else {
            write!(f, "{} ({}.{}:{})", self.name, self.domain, self.op_type, self.version)
        }
    }
}

/// A validated dataflow graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    value_infos: HashMap<String, ValueInfo>,
    initializers: BTreeMap<String, InitializerData>,
    opset: BTreeMap<String, u32>,
    topo_order: Vec<usize>,
    producers: HashMap<String, usize>,
    consumers: HashMap<String, Vec<usize>>,
    weight_providers: HashMap<String, ProviderType>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn initializers(&self) -> &BTreeMap<String, InitializerData> {
        &self.initializers
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|n| n == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|n| n == name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn value_info(&self, name: &str) -> Option<&ValueInfo> {
        self.value_infos.get(name)
    }

    pub fn value_type(&self, name: &str) -> Option<ValueType> {
        self.value_infos.get(name).map(|info| info.value_type)
    }

    /// Index of the node producing `name`
    pub fn producer(&self, name: &str) -> Option<usize> {
        self.producers.get(name).copied()
    }

    /// Indices of nodes reading `name`, ascending
    pub fn consumers(&self, name: &str) -> &[usize] {
        self.consumers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Node indices in execution order
    pub fn topological_order(&self) -> &[usize] {
        &self.topo_order
    }

    pub fn opset_version(&self, domain: &str) -> u32 {
        self.opset
            .get(domain)
            .copied()
            .unwrap_or_else(|| default_opset(domain))
    }

    /// Provider whose memory holds the weight `name` (set by partitioning)
    pub fn weight_provider(&self, name: &str) -> Option<&ProviderType> {
        self.weight_providers.get(name)
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    pub(crate) fn set_weight_provider(&mut self, name: &str, provider: ProviderType) {
        self.weight_providers.insert(name.to_string(), provider);
    }

    pub(crate) fn declare_value(&mut self, name: &str, info: ValueInfo) {
        self.value_infos.insert(name.to_string(), info);
    }

    /// Validate structure and recompute derived data (order, types).
    pub(crate) fn finalize(&mut self) -> ForgeResult<()> {
        self.index_nodes()?;
        self.index_values()?;
        self.topo_order = self.compute_topological_order()?;
        self.resolve_types()?;
        tracing::debug!(
            "Graph '{}' finalized: {} nodes, {} inputs, {} initializers, {} outputs",
            self.name,
            self.nodes.len(),
            self.inputs.len(),
            self.initializers.len(),
            self.outputs.len()
        );
        Ok(())
    }

    fn index_nodes(&mut self) -> ForgeResult<()> {
        let mut names = HashSet::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            node.index = index;
            if node.name.is_empty() {
                node.name = format!("{}_{}", node.op_type, index);
            }
            if node.version == 0 {
                node.version = self
                    .opset
                    .get(&node.domain)
                    .copied()
                    .unwrap_or_else(|| default_opset(&node.domain));
            }
            if !names.insert(node.name.clone()) {
                return Err(ForgeError::InvalidGraph(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            if node.outputs.is_empty() {
                return Err(ForgeError::InvalidGraph(format!(
                    "node '{}' has no outputs",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn index_values(&mut self) -> ForgeResult<()> {
        let mut defined: HashSet<&str> = HashSet::new();
        for name in self.inputs.iter().chain(self.initializers.keys()) {
            if !defined.insert(name.as_str()) {
                return Err(ForgeError::InvalidGraph(format!(
                    "value '{}' is defined more than once",
                    name
                )));
            }
        }

        let mut producers = HashMap::new();
        for node in &self.nodes {
            for out in &node.outputs {
                if out.is_empty() {
                    return Err(ForgeError::InvalidGraph(format!(
                        "node '{}' has an unnamed output",
                        node.name
                    )));
                }
                if defined.contains(out.as_str()) || producers.insert(out.clone(), node.index).is_some() {
                    return Err(ForgeError::InvalidGraph(format!(
                        "value '{}' has more than one producer",
                        out
                    )));
                }
            }
        }

        let mut consumers: HashMap<String, Vec<usize>> = HashMap::new();
        for node in &self.nodes {
            for input in node.input_defs().flatten() {
                if !defined.contains(input) && !producers.contains_key(input) {
                    return Err(ForgeError::InvalidGraph(format!(
                        "node '{}' reads undefined value '{}'",
                        node.name, input
                    )));
                }
                let entry = consumers.entry(input.to_string()).or_default();
                if entry.last() != Some(&node.index) {
                    entry.push(node.index);
                }
            }
        }

        let mut seen_outputs = HashSet::new();
        for out in &self.outputs {
            if !producers.contains_key(out) {
                return Err(ForgeError::InvalidGraph(format!(
                    "graph output '{}' is not produced by any node",
                    out
                )));
            }
            if !seen_outputs.insert(out.as_str()) {
                return Err(ForgeError::InvalidGraph(format!(
                    "graph output '{}' listed twice",
                    out
                )));
            }
        }

        self.producers = producers;
        self.consumers = consumers;
        Ok(())
    }

    /// Kahn's algorithm; among ready nodes the lowest index runs first.
    fn compute_topological_order(&self) -> ForgeResult<Vec<usize>> {
        let mut pending: Vec<usize> = vec![0; self.nodes.len()];
        for node in &self.nodes {
            let upstream: BTreeSet<usize> = node
                .input_defs()
                .flatten()
                .filter_map(|name| self.producers.get(name).copied())
                .collect();
            pending[node.index] = upstream.len();
        }

        let mut ready: BTreeSet<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = ready.pop_first() {
            order.push(index);
            let downstream: BTreeSet<usize> = self.nodes[index]
                .outputs
                .iter()
                .flat_map(|out| self.consumers(out).iter().copied())
                .collect();
            for next in downstream {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = pending
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .map(|(index, _)| self.nodes[index].name.as_str())
                .collect();
            return Err(ForgeError::InvalidGraph(format!(
                "graph contains a cycle through {:?}",
                stuck
            )));
        }
        Ok(order)
    }

    fn resolve_types(&mut self) -> ForgeResult<()> {
        for name in &self.inputs {
            if !self.value_infos.contains_key(name) {
                return Err(ForgeError::InvalidGraph(format!(
                    "graph input '{}' has no declared type",
                    name
                )));
            }
        }
        for (name, init) in &self.initializers {
            self.value_infos.insert(
                name.clone(),
                ValueInfo::new(ValueType::Tensor(init.dtype)).with_shape(init.shape.clone()),
            );
        }

        for position in 0..self.topo_order.len() {
            let index = self.topo_order[position];
            let node = &self.nodes[index];

            let first_tensor_type = node
                .input_defs()
                .flatten()
                .filter_map(|name| self.value_infos.get(name))
                .find_map(|info| info.value_type.element_type());

            let mut bindings = node.type_bindings.clone();
            if let Some(dtype) = first_tensor_type {
                bindings.entry("T".to_string()).or_insert(dtype);
            }

            let mut inferred = Vec::new();
            for out in &node.outputs {
                if self.value_infos.contains_key(out) {
                    continue;
                }
                match bindings.get("T") {
                    Some(dtype) => inferred.push((out.clone(), ValueInfo::new(ValueType::Tensor(*dtype)))),
                    None => {
                        return Err(ForgeError::InvalidGraph(format!(
                            "cannot infer the type of '{}' produced by '{}'",
                            out, node.name
                        )))
                    }
                }
            }

            self.value_infos.extend(inferred);
            self.nodes[index].type_bindings = bindings;
        }
        Ok(())
    }
}

/// Builder for [`Graph`]
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    error: Option<ForgeError>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph {
                name: name.into(),
                ..Graph::default()
            },
            error: None,
        }
    }

    /// Declare a graph input
    pub fn input(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        let name = name.into();
        self.graph.value_infos.insert(name.clone(), ValueInfo::new(value_type));
        self.graph.inputs.push(name);
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.graph.outputs.push(name.into());
        self
    }

    /// Declare the type (and optionally shape) of any value
    pub fn value_info(mut self, name: impl Into<String>, info: ValueInfo) -> Self {
        self.graph.value_infos.insert(name.into(), info);
        self
    }

    /// Add a weight
    pub fn initializer<T: TensorElement>(
        mut self,
        name: impl Into<String>,
        shape: impl Into<TensorShape>,
        data: &[T],
    ) -> Self {
        let name = name.into();
        match InitializerData::from_slice(shape, data) {
            Ok(init) => {
                self.graph.initializers.insert(name, init);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Import an opset version for a domain
    pub fn opset(mut self, domain: impl Into<String>, version: u32) -> Self {
        self.graph.opset.insert(domain.into(), version);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.push(node);
        self
    }

    pub fn build(self) -> ForgeResult<Graph> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut graph = self.graph;
        graph.finalize()?;
        Ok(graph)
    }
}
