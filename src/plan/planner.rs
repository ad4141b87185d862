//! Allocation planner
//!
//! Walks the graph in topological order and decides, per value, where it
//! lives and how it is materialized. Buffer reuse is limited to in-place
//! reuse declared by the kernel (`may_inplace`): the output takes over the
//! input's buffer when the input is a frame allocation that dies at this
//! node. Broadcasting kernels (`may_inplace_if_fits`) only get the buffer
//! when the declared shapes show the output fits. The planner never emits reuse chains; memory of other dead values
//! is recycled by the arena's size-class pools instead.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::graph::Graph;
use crate::kernel::KernelDef;
use crate::memory::MemType;
use crate::plan::{AllocKind, AllocPlanEntry, AllocationPlan, ExecutionPlan, ExecutionStep, ValueNameIdxMap};
use crate::provider::{ProviderTable, ProviderType};
use crate::tensor::required_bytes;

/// Builds the [`ExecutionPlan`] of a partitioned graph
pub struct AllocationPlanner<'a> {
    graph: &'a Graph,
    values: &'a ValueNameIdxMap,
    kernel_defs: &'a [KernelDef],
    providers: &'a ProviderTable,
    host_provider: ProviderType,
    enable_memory_reuse: bool,
}

impl<'a> AllocationPlanner<'a> {
    /// `kernel_defs[i]` is the definition of the kernel chosen for node `i`
    pub fn new(
        graph: &'a Graph,
        values: &'a ValueNameIdxMap,
        kernel_defs: &'a [KernelDef],
        providers: &'a ProviderTable,
    ) -> Self {
        Self {
            graph,
            values,
            kernel_defs,
            providers,
            host_provider: ProviderType::CPU,
            enable_memory_reuse: true,
        }
    }

    pub fn with_memory_reuse(mut self, enabled: bool) -> Self {
        self.enable_memory_reuse = enabled;
        self
    }

    pub fn with_host_provider(mut self, provider: ProviderType) -> Self {
        self.host_provider = provider;
        self
    }

    pub fn create_plan(&self) -> ForgeResult<ExecutionPlan> {
        if self.kernel_defs.len() != self.graph.nodes().len() {
            return Err(ForgeError::InvalidPlan(format!(
                "{} kernel definitions for {} nodes",
                self.kernel_defs.len(),
                self.graph.nodes().len()
            )));
        }

        let mut entries = self.initial_entries()?;
        let order = self.graph.topological_order();
        let last_use = self.last_use_positions(order);

        if self.enable_memory_reuse {
            self.plan_inplace_reuse(order, &last_use, &mut entries);
        }
        self.plan_fences(&mut entries);

        let steps = self.plan_releases(order, &last_use);
        let plan = ExecutionPlan {
            steps,
            allocation_plan: Arc::new(AllocationPlan::new(entries)),
        };
        plan.allocation_plan.validate()?;

        tracing::debug!(
            "Planned {} values over {} steps ({} in-place reuses)",
            plan.allocation_plan.len(),
            plan.steps.len(),
            plan.allocation_plan
                .entries()
                .iter()
                .filter(|e| matches!(e.kind, AllocKind::Reuse { .. }))
                .count()
        );
        Ok(plan)
    }

    fn value_type(&self, name: &str) -> ForgeResult<crate::value::ValueType> {
        self.graph
            .value_type(name)
            .ok_or_else(|| ForgeError::InvalidGraph(format!("value '{}' has no type", name)))
    }

    fn initial_entries(&self) -> ForgeResult<Vec<AllocPlanEntry>> {
        let mut entries: Vec<Option<AllocPlanEntry>> = vec![None; self.values.len()];

        let host = self.providers.location(&self.host_provider, MemType::Default)?;
        for name in self.graph.inputs() {
            let id = self.values.require(name)?;
            entries[id] = Some(AllocPlanEntry::new(
                self.value_type(name)?,
                host.clone(),
                AllocKind::PreExisting,
            ));
        }

        for name in self.graph.initializers().keys() {
            let id = self.values.require(name)?;
            let provider = self
                .graph
                .weight_provider(name)
                .unwrap_or(&self.host_provider);
            entries[id] = Some(AllocPlanEntry::new(
                self.value_type(name)?,
                self.providers.location(provider, MemType::Default)?,
                AllocKind::PreExisting,
            ));
        }

        for node in self.graph.nodes() {
            let provider = node.assigned_provider().ok_or_else(|| {
                ForgeError::InvalidPlan(format!("{} has no execution provider", node))
            })?;
            let def = &self.kernel_defs[node.index()];
            for (slot, out) in node.output_names().iter().enumerate() {
                let id = self.values.require(out)?;
                let location = self.providers.location(provider, def.output_memory_type(slot))?;
                entries[id] = Some(AllocPlanEntry::new(
                    self.value_type(out)?,
                    location,
                    AllocKind::Allocate,
                ));
            }
        }

        entries
            .into_iter()
            .enumerate()
            .map(|(id, entry)| {
                entry.ok_or_else(|| {
                    ForgeError::InvalidPlan(format!("value '{}' has no producer", self.values.name(id)))
                })
            })
            .collect()
    }

    /// Position (in `order`) of the last step touching each value
    fn last_use_positions(&self, order: &[usize]) -> Vec<Option<usize>> {
        let mut last_use = vec![None; self.values.len()];
        for (position, &index) in order.iter().enumerate() {
            let node = self.graph.node(index);
            let touched = node
                .input_defs()
                .flatten()
                .chain(node.output_names().iter().map(String::as_str));
            for name in touched {
                if let Some(id) = self.values.get(name) {
                    last_use[id] = Some(position);
                }
            }
        }
        last_use
    }

    fn plan_inplace_reuse(&self, order: &[usize], last_use: &[Option<usize>], entries: &mut [AllocPlanEntry]) {
        let mut donated = HashSet::new();

        for (position, &index) in order.iter().enumerate() {
            let node = self.graph.node(index);
            let def = &self.kernel_defs[index];

            let pairs = def
                .may_inplace()
                .iter()
                .map(|&pair| (pair, false))
                .chain(def.may_inplace_if_fits().iter().map(|&pair| (pair, true)));
            for ((input_slot, output_slot), must_fit) in pairs {
                let Some(Some(input)) = node.input_defs().nth(input_slot) else {
                    continue;
                };
                let Some(output) = node.output_names().get(output_slot) else {
                    continue;
                };
                let (Some(donor), Some(consumer)) = (self.values.get(input), self.values.get(output)) else {
                    continue;
                };

                let eligible = entries[donor].kind == AllocKind::Allocate
                    && entries[consumer].kind == AllocKind::Allocate
                    && donor != consumer
                    && !donated.contains(&donor)
                    && !self.graph.is_graph_output(input)
                    && last_use[donor] == Some(position)
                    && entries[donor].value_type == entries[consumer].value_type
                    && entries[donor].value_type.is_tensor()
                    && entries[donor].location == entries[consumer].location
                    && self.fits(input, output, must_fit);

                if eligible {
                    tracing::debug!(
                        "{}: '{}' reuses the buffer of '{}'",
                        node,
                        output,
                        input
                    );
                    entries[consumer].kind = AllocKind::Reuse { donor };
                    donated.insert(donor);
                }
            }
        }
    }

    /// Whether `output` fits in the buffer of `input` as far as the graph's
    /// static shapes tell. Without both shapes only an unconditional pair
    /// qualifies.
    fn fits(&self, input: &str, output: &str, must_fit: bool) -> bool {
        match (self.static_bytes(input), self.static_bytes(output)) {
            (Some(donor), Some(consumer)) => consumer <= donor,
            _ => !must_fit,
        }
    }

    fn static_bytes(&self, name: &str) -> Option<usize> {
        let info = self.graph.value_info(name)?;
        let dtype = info.value_type.element_type()?;
        required_bytes(dtype, info.shape.as_ref()?).ok()
    }

    /// A value needs a fence when an asynchronous provider and at least one
    /// other provider touch it. Graph outputs count the host as a reader.
    fn plan_fences(&self, entries: &mut [AllocPlanEntry]) {
        for (id, name) in self.values.iter() {
            let mut touching: BTreeSet<ProviderType> = BTreeSet::new();

            match self.graph.producer(name) {
                Some(index) => {
                    if let Some(p) = self.graph.node(index).assigned_provider() {
                        touching.insert(p.clone());
                    }
                }
                None => {
                    let owner = self
                        .graph
                        .weight_provider(name)
                        .cloned()
                        .unwrap_or_else(|| self.host_provider.clone());
                    touching.insert(owner);
                }
            }
            for &index in self.graph.consumers(name) {
                if let Some(p) = self.graph.node(index).assigned_provider() {
                    touching.insert(p.clone());
                }
            }
            if self.graph.is_graph_output(name) {
                touching.insert(self.host_provider.clone());
            }

            if touching.len() < 2 {
                continue;
            }
            let async_provider = touching
                .iter()
                .find(|p| self.providers.get(p).map(|ep| ep.is_async()).unwrap_or(false));
            if let Some(provider) = async_provider {
                tracing::trace!("Value '{}' fenced by {}", name, provider);
                entries[id].create_fence = true;
                entries[id].fence_provider = Some(provider.clone());
            }
        }
    }

    fn plan_releases(&self, order: &[usize], last_use: &[Option<usize>]) -> Vec<ExecutionStep> {
        let mut steps: Vec<ExecutionStep> = order
            .iter()
            .map(|&node_index| ExecutionStep {
                node_index,
                free_after: Vec::new(),
            })
            .collect();

        for (id, name) in self.values.iter() {
            if self.graph.is_graph_output(name) || self.graph.is_initializer(name) {
                continue;
            }
            if let Some(position) = last_use[id] {
                steps[position].free_after.push(id);
            }
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::kernel::KernelDefBuilder;
    use crate::provider::cpu::CpuExecutionProvider;
    use crate::tensor::DataType;
    use crate::value::ValueType;

    fn providers() -> ProviderTable {
        let mut table = ProviderTable::new();
        table.add(Arc::new(CpuExecutionProvider::default())).unwrap();
        table
    }

    fn def(op: &str, inplace: bool) -> KernelDef {
        let builder = KernelDefBuilder::new(op).type_constraint("T", [DataType::F32]);
        if inplace {
            builder.may_inplace(0, 0).build()
        } else {
            builder.build()
        }
    }

    fn chain() -> Graph {
        Graph::builder("chain")
            .input("x", ValueType::Tensor(DataType::F32))
            .node(Node::new("Scale").inputs(["x"]).outputs(["a"]).provider(ProviderType::CPU))
            .node(Node::new("Relu").inputs(["a"]).outputs(["b"]).provider(ProviderType::CPU))
            .node(Node::new("Sigmoid").inputs(["b"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("y")
            .build()
            .unwrap()
    }

    #[test]
    fn test_chain_plan() {
        let graph = chain();
        let values = ValueNameIdxMap::new(&graph);
        let defs = vec![def("Scale", true), def("Relu", true), def("Sigmoid", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .create_plan()
            .unwrap();
        let entry = |name: &str| plan.allocation_plan.entry(values.get(name).unwrap()).clone();

        // Feeds are never reused, so Scale allocates
        assert_eq!(entry("x").kind, AllocKind::PreExisting);
        assert_eq!(entry("a").kind, AllocKind::Allocate);
        // Relu takes over `a`
        assert_eq!(
            entry("b").kind,
            AllocKind::Reuse {
                donor: values.get("a").unwrap()
            }
        );
        // `b` is itself a reuse, so no chain: Sigmoid allocates
        assert_eq!(entry("y").kind, AllocKind::Allocate);
        assert!(!entry("y").create_fence);

        // Each intermediate dies right after its consumer; the output never does
        let freed: Vec<Vec<&str>> = plan
            .steps
            .iter()
            .map(|s| s.free_after.iter().map(|&id| values.name(id)).collect())
            .collect();
        assert_eq!(freed, vec![vec!["x"], vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_reuse_disabled() {
        let graph = chain();
        let values = ValueNameIdxMap::new(&graph);
        let defs = vec![def("Scale", true), def("Relu", true), def("Sigmoid", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .with_memory_reuse(false)
            .create_plan()
            .unwrap();
        assert!(plan
            .allocation_plan
            .entries()
            .iter()
            .all(|e| !matches!(e.kind, AllocKind::Reuse { .. })));
    }

    #[test]
    fn test_no_reuse_when_input_lives_on() {
        // `a` feeds both Relu and Sigmoid, so Relu may not overwrite it
        let graph = Graph::builder("fanout")
            .input("x", ValueType::Tensor(DataType::F32))
            .node(Node::new("Scale").inputs(["x"]).outputs(["a"]).provider(ProviderType::CPU))
            .node(Node::new("Relu").inputs(["a"]).outputs(["b"]).provider(ProviderType::CPU))
            .node(Node::new("Add").inputs(["a", "b"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("y")
            .build()
            .unwrap();
        let values = ValueNameIdxMap::new(&graph);
        let defs = vec![def("Scale", false), def("Relu", true), def("Add", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .create_plan()
            .unwrap();

        let b = plan.allocation_plan.entry(values.get("b").unwrap());
        assert_eq!(b.kind, AllocKind::Allocate);
        let y = plan.allocation_plan.entry(values.get("y").unwrap());
        assert_eq!(
            y.kind,
            AllocKind::Reuse {
                donor: values.get("a").unwrap()
            }
        );
    }

    #[test]
    fn test_graph_output_never_donates() {
        let graph = Graph::builder("out")
            .input("x", ValueType::Tensor(DataType::F32))
            .node(Node::new("Scale").inputs(["x"]).outputs(["a"]).provider(ProviderType::CPU))
            .node(Node::new("Relu").inputs(["a"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("a")
            .output("y")
            .build()
            .unwrap();
        let values = ValueNameIdxMap::new(&graph);
        let defs = vec![def("Scale", false), def("Relu", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .create_plan()
            .unwrap();
        let y = plan.allocation_plan.entry(values.get("y").unwrap());
        assert_eq!(y.kind, AllocKind::Allocate);
        assert!(plan.steps.iter().all(|s| s.free_after.is_empty() || s.free_after == vec![0]));
    }

    /// `x -Relu-> a; Add(a, z[4]) -> s; Relu(s) -> y` with optional
    /// declared shapes for `a` and `s`
    fn broadcast_plan(a: Option<usize>, s: Option<usize>) -> (ValueNameIdxMap, ExecutionPlan) {
        let f32_info = || crate::graph::ValueInfo::new(ValueType::Tensor(DataType::F32));
        let mut builder = Graph::builder("broadcast")
            .input("x", ValueType::Tensor(DataType::F32))
            .initializer("z", [4], &[1.0f32, 2.0, 3.0, 4.0]);
        if let Some(len) = a {
            builder = builder.value_info("a", f32_info().with_shape([len]));
        }
        if let Some(len) = s {
            builder = builder.value_info("s", f32_info().with_shape([len]));
        }
        let graph = builder
            .node(Node::new("Relu").inputs(["x"]).outputs(["a"]).provider(ProviderType::CPU))
            .node(Node::new("Add").inputs(["a", "z"]).outputs(["s"]).provider(ProviderType::CPU))
            .node(Node::new("Relu").inputs(["s"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("y")
            .build()
            .unwrap();
        let values = ValueNameIdxMap::new(&graph);
        let add = KernelDefBuilder::new("Add")
            .type_constraint("T", [DataType::F32])
            .may_inplace_if_fits(0, 0)
            .build();
        let defs = vec![def("Relu", true), add, def("Relu", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .create_plan()
            .unwrap();
        (values, plan)
    }

    #[test]
    fn test_broadcast_reuse_needs_static_shapes() {
        let (values, plan) = broadcast_plan(None, None);
        let s = plan.allocation_plan.entry(values.get("s").unwrap());
        assert_eq!(s.kind, AllocKind::Allocate);
    }

    #[test]
    fn test_broadcast_output_larger_than_donor() {
        let (values, plan) = broadcast_plan(Some(1), Some(4));
        let s = plan.allocation_plan.entry(values.get("s").unwrap());
        assert_eq!(s.kind, AllocKind::Allocate);
        // `s` is free to donate to the shape-preserving Relu
        let y = plan.allocation_plan.entry(values.get("y").unwrap());
        assert_eq!(
            y.kind,
            AllocKind::Reuse {
                donor: values.get("s").unwrap()
            }
        );
    }

    #[test]
    fn test_broadcast_reuse_when_output_fits() {
        let (values, plan) = broadcast_plan(Some(4), Some(4));
        let s = plan.allocation_plan.entry(values.get("s").unwrap());
        assert_eq!(
            s.kind,
            AllocKind::Reuse {
                donor: values.get("a").unwrap()
            }
        );
    }

    #[test]
    fn test_declared_mismatch_blocks_unconditional_reuse() {
        let graph = Graph::builder("shrink")
            .input("x", ValueType::Tensor(DataType::F32))
            .value_info(
                "a",
                crate::graph::ValueInfo::new(ValueType::Tensor(DataType::F32)).with_shape([2]),
            )
            .value_info(
                "y",
                crate::graph::ValueInfo::new(ValueType::Tensor(DataType::F32)).with_shape([8]),
            )
            .node(Node::new("Scale").inputs(["x"]).outputs(["a"]).provider(ProviderType::CPU))
            .node(Node::new("Relu").inputs(["a"]).outputs(["y"]).provider(ProviderType::CPU))
            .output("y")
            .build()
            .unwrap();
        let values = ValueNameIdxMap::new(&graph);
        let defs = vec![def("Scale", false), def("Relu", true)];
        let table = providers();
        let plan = AllocationPlanner::new(&graph, &values, &defs, &table)
            .create_plan()
            .unwrap();
        let y = plan.allocation_plan.entry(values.get("y").unwrap());
        assert_eq!(y.kind, AllocKind::Allocate);
    }

    #[test]
    fn test_kernel_def_count_mismatch() {
        let graph = chain();
        let values = ValueNameIdxMap::new(&graph);
        let table = providers();
        let err = AllocationPlanner::new(&graph, &values, &[], &table)
            .create_plan()
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidPlan(_)));
    }
}
