//! Provider assignment and copy insertion
//!
//! Every node is bound to exactly one execution provider: a node that names
//! a provider keeps it, the rest go to the first provider (in priority
//! order) whose kernel registries can run them. Wherever a value lives in
//! one memory space and is read from another, an explicit copy node is
//! inserted:
//!
//! - host value read by a device node: `MemcpyFromHost` on that device
//! - device value read by a host node: `MemcpyToHost` on the producing device
//! - graph output produced on a device: the producer writes `<name>__device`
//!   and a `MemcpyToHost` produces `<name>` in host memory
//!
//! Weights live on the device when all of their consumers run there, and in
//! host memory otherwise.

use std::collections::{HashMap, HashSet};

use crate::error::{ForgeError, ForgeResult};
use crate::graph::{Graph, Node, INTERNAL_DOMAIN};
use crate::provider::ProviderType;

pub const MEMCPY_FROM_HOST: &str = "MemcpyFromHost";
pub const MEMCPY_TO_HOST: &str = "MemcpyToHost";

/// Inputs to partitioning
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Providers in assignment priority order
    pub priority: Vec<ProviderType>,
    /// Providers whose default memory is not host memory
    pub device_providers: HashSet<ProviderType>,
    /// Provider owning host memory (graph inputs, shared weights)
    pub host_provider: ProviderType,
}

impl PartitionOptions {
    fn is_device(&self, provider: &ProviderType) -> bool {
        self.device_providers.contains(provider)
    }
}

/// Where a value's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Home {
    Host,
    Device(ProviderType),
}

/// Assign providers and insert copies. `resolves(node, provider)` reports
/// whether `provider` has a kernel for `node`.
pub fn partition<F>(graph: &Graph, options: &PartitionOptions, resolves: F) -> ForgeResult<Graph>
where
    F: Fn(&Node, &ProviderType) -> ForgeResult<bool>,
{
    let mut graph = graph.clone();
    assign_providers(&mut graph, options, &resolves)?;

    let mut homes = HashMap::new();
    for name in graph.inputs() {
        homes.insert(name.clone(), Home::Host);
    }
    place_weights(&mut graph, options, &mut homes);
    for node in graph.nodes() {
        let home = node_home(node, options);
        for out in node.output_names() {
            homes.insert(out.clone(), home.clone());
        }
    }

    let mut inserter = CopyInserter::new(&graph, homes);
    inserter.redirect_device_outputs(&mut graph, options);
    inserter.insert_input_copies(&mut graph, options);
    let copies = inserter.finish();
    if !copies.is_empty() {
        tracing::debug!("Partition inserted {} copy nodes", copies.len());
    }
    graph.nodes_mut().extend(copies);

    graph.finalize()?;
    Ok(graph)
}

fn assign_providers<F>(graph: &mut Graph, options: &PartitionOptions, resolves: &F) -> ForgeResult<()>
where
    F: Fn(&Node, &ProviderType) -> ForgeResult<bool>,
{
    for node in graph.nodes_mut().iter_mut() {
        if let Some(preset) = node.assigned_provider() {
            if !options.priority.contains(preset) {
                return Err(ForgeError::Fail(format!(
                    "node {} is assigned to unregistered provider {}",
                    node, preset
                )));
            }
            continue;
        }

        let mut chosen = None;
        for provider in &options.priority {
            if resolves(node, provider)? {
                chosen = Some(provider.clone());
                break;
            }
        }
        match chosen {
            Some(provider) => {
                tracing::debug!("Assigned {} to {}", node, provider);
                node.set_provider(provider);
            }
            None => {
                return Err(ForgeError::KernelNotFound(format!(
                    "no registered provider has a kernel for {} with bindings {:?}",
                    node,
                    node.type_bindings()
                )))
            }
        }
    }
    Ok(())
}

fn node_home(node: &Node, options: &PartitionOptions) -> Home {
    match node.assigned_provider() {
        Some(p) if options.is_device(p) && node.op_type() != MEMCPY_TO_HOST => Home::Device(p.clone()),
        _ => Home::Host,
    }
}

fn place_weights(graph: &mut Graph, options: &PartitionOptions, homes: &mut HashMap<String, Home>) {
    let names: Vec<String> = graph.initializers().keys().cloned().collect();
    for name in names {
        let consumer_providers: HashSet<ProviderType> = graph
            .consumers(&name)
            .iter()
            .filter_map(|&i| graph.node(i).assigned_provider().cloned())
            .collect();

        let provider = match consumer_providers.into_iter().collect::<Vec<_>>().as_slice() {
            [only] if options.is_device(only) => only.clone(),
            _ => options.host_provider.clone(),
        };
        let home = if options.is_device(&provider) {
            Home::Device(provider.clone())
        } else {
            Home::Host
        };
        homes.insert(name.clone(), home);
        graph.set_weight_provider(&name, provider);
    }
}

struct CopyInserter {
    homes: HashMap<String, Home>,
    taken: HashSet<String>,
    /// (source value, destination home) → copy name
    copies: HashMap<(String, Home), String>,
    new_nodes: Vec<Node>,
}

impl CopyInserter {
    fn new(graph: &Graph, homes: HashMap<String, Home>) -> Self {
        let mut taken: HashSet<String> = homes.keys().cloned().collect();
        for node in graph.nodes() {
            taken.extend(node.input_names().iter().cloned());
        }
        Self {
            homes,
            taken,
            copies: HashMap::new(),
            new_nodes: Vec::new(),
        }
    }

    fn unique_name(&mut self, base: String) -> String {
        let mut candidate = base.clone();
        let mut n = 1;
        while self.taken.contains(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    fn copy_node(op: &str, provider: &ProviderType, input: &str, output: &str) -> Node {
        Node::new(op)
            .name(format!("{}_{}", op, output))
            .domain(INTERNAL_DOMAIN)
            .version(1)
            .input(input)
            .output(output)
            .provider(provider.clone())
    }

    /// Graph outputs produced on a device get a host copy under the original name
    fn redirect_device_outputs(&mut self, graph: &mut Graph, options: &PartitionOptions) {
        let outputs: Vec<String> = graph.outputs().to_vec();
        for out in outputs {
            let device = match self.homes.get(&out) {
                Some(Home::Device(p)) => p.clone(),
                _ => continue,
            };
            let device_name = self.unique_name(format!("{}__device", out));
            if let Some(info) = graph.value_info(&out).cloned() {
                graph.declare_value(&device_name, info);
            }

            for node in graph.nodes_mut().iter_mut() {
                let on_device = node
                    .assigned_provider()
                    .map(|p| options.is_device(p))
                    .unwrap_or(false);
                for o in node.outputs_mut().iter_mut() {
                    if *o == out {
                        *o = device_name.clone();
                    }
                }
                if on_device {
                    for i in node.inputs_mut().iter_mut() {
                        if *i == out {
                            *i = device_name.clone();
                        }
                    }
                }
            }

            self.homes.insert(device_name.clone(), Home::Device(device.clone()));
            self.homes.insert(out.clone(), Home::Host);
            self.copies
                .insert((device_name.clone(), Home::Host), out.clone());
            self.new_nodes
                .push(Self::copy_node(MEMCPY_TO_HOST, &device, &device_name, &out));
        }
    }

    fn insert_input_copies(&mut self, graph: &mut Graph, options: &PartitionOptions) {
        for node in graph.nodes_mut().iter_mut() {
            let target = node_home(node, options);
            let inputs = node.input_names().to_vec();
            for (slot, input) in inputs.iter().enumerate() {
                if input.is_empty() {
                    continue;
                }
                let source = match self.homes.get(input) {
                    Some(home) => home.clone(),
                    None => continue,
                };
                if source == target {
                    continue;
                }
                let copied = self.materialize(input, &source, &target);
                node.inputs_mut()[slot] = copied;
            }
        }
    }

    /// Name of a copy of `value` living in `target`, creating copy nodes as needed
    fn materialize(&mut self, value: &str, source: &Home, target: &Home) -> String {
        if let Some(existing) = self.copies.get(&(value.to_string(), target.clone())) {
            return existing.clone();
        }

        let name = match (source, target) {
            (Home::Host, Home::Device(device)) => {
                let name = self.unique_name(format!("{}__device", value));
                self.new_nodes
                    .push(Self::copy_node(MEMCPY_FROM_HOST, device, value, &name));
                name
            }
            (Home::Device(device), Home::Host) => {
                let name = self.unique_name(format!("{}__host", value));
                self.new_nodes
                    .push(Self::copy_node(MEMCPY_TO_HOST, device, value, &name));
                name
            }
            (Home::Device(_), Home::Device(_)) => {
                let staged = self.materialize(value, source, &Home::Host);
                self.materialize(&staged, &Home::Host, target)
            }
            (Home::Host, Home::Host) => value.to_string(),
        };

        self.homes.insert(name.clone(), target.clone());
        self.copies
            .insert((value.to_string(), target.clone()), name.clone());
        name
    }

    fn finish(self) -> Vec<Node> {
        self.new_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;
    use crate::value::ValueType;

    fn stream() -> ProviderType {
        ProviderType::STREAM
    }

    fn options() -> PartitionOptions {
        PartitionOptions {
            priority: vec![stream(), ProviderType::CPU],
            device_providers: [stream()].into_iter().collect(),
            host_provider: ProviderType::CPU,
        }
    }

    /// Stream runs Add and Relu, everything else falls through to CPU
    fn resolves(node: &Node, provider: &ProviderType) -> ForgeResult<bool> {
        if *provider == ProviderType::STREAM {
            Ok(matches!(node.op_type(), "Add" | "Relu"))
        } else {
            Ok(true)
        }
    }

    fn f32_type() -> ValueType {
        ValueType::Tensor(DataType::F32)
    }

    #[test]
    fn test_all_host_graph_unchanged() {
        let graph = Graph::builder("host")
            .input("x", f32_type())
            .node(Node::new("Sigmoid").inputs(["x"]).outputs(["y"]))
            .output("y")
            .build()
            .unwrap();
        let parted = partition(&graph, &options(), resolves).unwrap();
        assert_eq!(parted.nodes().len(), 1);
        assert_eq!(parted.node(0).assigned_provider(), Some(&ProviderType::CPU));
    }

    #[test]
    fn test_copies_inserted_around_device_nodes() {
        let graph = Graph::builder("mixed")
            .input("x", f32_type())
            .initializer("b", [2], &[1.0f32, 2.0])
            .node(Node::new("Add").inputs(["x", "b"]).outputs(["s"]))
            .node(Node::new("Relu").inputs(["s"]).outputs(["y"]))
            .output("y")
            .build()
            .unwrap();
        let parted = partition(&graph, &options(), resolves).unwrap();

        let ops: Vec<&str> = parted.nodes().iter().map(|n| n.op_type()).collect();
        assert_eq!(ops, vec!["Add", "Relu", MEMCPY_TO_HOST, MEMCPY_FROM_HOST]);

        // Weight consumed only on the device lives there
        assert_eq!(parted.weight_provider("b"), Some(&stream()));
        // Host input reaches Add through a copy
        assert_eq!(parted.node(0).input_names(), &["x__device".to_string(), "b".to_string()]);
        // Graph output is produced on host by the copy back
        assert_eq!(parted.node(1).output_names(), &["y__device".to_string()]);
        let back = parted.producer("y").unwrap();
        assert_eq!(parted.node(back).op_type(), MEMCPY_TO_HOST);
        assert_eq!(parted.value_type("y__device"), Some(f32_type()));

        // Execution order still respects the copies
        let order = parted.topological_order();
        let pos = |op: &str| {
            order
                .iter()
                .position(|&i| parted.node(i).op_type() == op)
                .unwrap()
        };
        assert!(pos(MEMCPY_FROM_HOST) < pos("Add"));
        assert!(pos("Relu") < pos(MEMCPY_TO_HOST));
    }

    #[test]
    fn test_device_value_read_on_host() {
        let graph = Graph::builder("back")
            .input("x", f32_type())
            .node(Node::new("Relu").inputs(["x"]).outputs(["r"]))
            .node(Node::new("Sigmoid").inputs(["r"]).outputs(["y"]))
            .output("y")
            .build()
            .unwrap();
        let parted = partition(&graph, &options(), resolves).unwrap();
        assert_eq!(parted.node(1).input_names(), &["r__host".to_string()]);
        assert_eq!(parted.node(1).assigned_provider(), Some(&ProviderType::CPU));
    }

    #[test]
    fn test_preassigned_node_respected() {
        let graph = Graph::builder("pinned")
            .input("x", f32_type())
            .node(Node::new("Relu").inputs(["x"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("y")
            .build()
            .unwrap();
        let parted = partition(&graph, &options(), resolves).unwrap();
        assert_eq!(parted.nodes().len(), 1);
        assert_eq!(parted.node(0).assigned_provider(), Some(&ProviderType::CPU));
    }

    #[test]
    fn test_unrunnable_node() {
        let graph = Graph::builder("none")
            .input("x", f32_type())
            .node(Node::new("Unknown").inputs(["x"]).outputs(["y"]))
            .output("y")
            .build()
            .unwrap();
        let only_stream = PartitionOptions {
            priority: vec![stream()],
            ..options()
        };
        let err = partition(&graph, &only_stream, resolves).unwrap_err();
        assert!(matches!(err, ForgeError::KernelNotFound(_)));
    }
}
