//! Immutable state shared by every run of an initialized session

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::executor::ExecutionFrame;
use crate::graph::partition::{partition, PartitionOptions};
use crate::graph::Graph;
use crate::kernel::{KernelDef, KernelRegistry, KernelRegistryManager, OpKernel};
use crate::plan::{AllocationPlanner, ExecutionPlan, ValueNameIdxMap};
use crate::provider::{ProviderTable, ProviderType};
use crate::session::config::SessionOptions;
use crate::tensor::Tensor;
use crate::value::Value;

/// Partitioned graph, plan, kernels and weights of a session
pub struct SessionState {
    graph: Graph,
    value_map: ValueNameIdxMap,
    plan: ExecutionPlan,
    kernels: Vec<Box<dyn OpKernel>>,
    registries: KernelRegistryManager,
    providers: Arc<ProviderTable>,
    weights: Vec<(usize, Value)>,
}

impl SessionState {
    /// Partition `graph` over `providers`, create its kernels, plan its
    /// memory and upload its weights
    pub fn build(
        graph: &Graph,
        providers: ProviderTable,
        custom_registries: &[Arc<KernelRegistry>],
        options: &SessionOptions,
    ) -> ForgeResult<Self> {
        let mut registries = KernelRegistryManager::new();
        for registry in custom_registries {
            registries.register_custom_registry(Arc::clone(registry));
        }
        registries.register_providers(&providers);

        let partition_options = partition_options(&providers, options)?;
        let graph = partition(graph, &partition_options, |node, provider| {
            registries.search(node, provider).map(|found| found.is_some())
        })?;

        let value_map = ValueNameIdxMap::new(&graph);
        let mut defs: Vec<KernelDef> = Vec::with_capacity(graph.nodes().len());
        let mut kernels: Vec<Box<dyn OpKernel>> = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let info = registries.find(node)?;
            tracing::debug!("{} uses kernel {}", node, info.def);
            defs.push(info.def.clone());
            kernels.push(info.instantiate(node)?);
        }

        let plan = AllocationPlanner::new(&graph, &value_map, &defs, &providers)
            .with_memory_reuse(options.enable_memory_reuse)
            .with_host_provider(partition_options.host_provider.clone())
            .create_plan()?;

        let weights = upload_weights(&graph, &value_map, &plan, &providers)?;

        Ok(Self {
            graph,
            value_map,
            plan,
            kernels,
            registries,
            providers: Arc::new(providers),
            weights,
        })
    }

    /// The graph after partitioning (copy nodes included)
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn value_map(&self) -> &ValueNameIdxMap {
        &self.value_map
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn kernels(&self) -> &[Box<dyn OpKernel>] {
        &self.kernels
    }

    pub fn registries(&self) -> &KernelRegistryManager {
        &self.registries
    }

    pub fn providers(&self) -> &Arc<ProviderTable> {
        &self.providers
    }

    pub fn num_weights(&self) -> usize {
        self.weights.len()
    }

    /// Fresh frame holding the weights
    pub fn create_frame(&self) -> ForgeResult<ExecutionFrame> {
        let mut frame = ExecutionFrame::new(
            &self.graph,
            &self.value_map,
            Arc::clone(&self.plan.allocation_plan),
            Arc::clone(&self.providers),
        );
        for (id, weight) in &self.weights {
            frame.insert_preexisting(*id, weight.detached())?;
        }
        Ok(frame)
    }
}

fn partition_options(providers: &ProviderTable, options: &SessionOptions) -> ForgeResult<PartitionOptions> {
    let priority = match &options.provider_priority {
        Some(order) => {
            for provider in order {
                providers.require(provider).map_err(|_| {
                    ForgeError::InvalidArgument(format!(
                        "provider_priority names {}, which is not registered",
                        provider
                    ))
                })?;
            }
            order.clone()
        }
        None => providers.types(),
    };
    let device_providers: HashSet<ProviderType> = providers
        .iter()
        .filter(|p| p.is_device())
        .map(|p| p.provider_type().clone())
        .collect();
    Ok(PartitionOptions {
        priority,
        device_providers,
        host_provider: ProviderType::CPU,
    })
}

/// Copy every initializer into memory at its planned location
fn upload_weights(
    graph: &Graph,
    value_map: &ValueNameIdxMap,
    plan: &ExecutionPlan,
    providers: &ProviderTable,
) -> ForgeResult<Vec<(usize, Value)>> {
    let mut weights = Vec::with_capacity(graph.initializers().len());
    for (name, data) in graph.initializers() {
        let id = value_map.require(name)?;
        let location = &plan.allocation_plan.entry(id).location;
        let allocator = providers.allocator_for(location).ok_or_else(|| {
            ForgeError::NotFound(format!("no allocator for weight '{}' at {}", name, location))
        })?;
        let tensor = Tensor::allocate(allocator.as_ref(), data.dtype, data.shape.clone())?;
        tensor.copy_from_bytes(&data.bytes)?;
        tracing::debug!("Weight '{}' ({} bytes) placed at {}", name, data.bytes.len(), location);
        weights.push((id, Value::from_tensor(tensor)));
    }
    Ok(weights)
}
