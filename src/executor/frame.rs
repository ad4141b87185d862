//! Per-run value store
//!
//! An [`ExecutionFrame`] holds one [`Value`] slot per value id of the
//! session's plan. Feeds and weights are inserted as pre-existing values;
//! every other value is materialized lazily when its producing kernel asks
//! for the output, following the allocation plan. The frame records whether
//! a slot owns its buffer or borrows it from a donor.

use std::sync::Arc;

use crate::enforce;
use crate::error::{ForgeError, ForgeResult};
use crate::graph::Graph;
use crate::memory::{AllocatorInfo, BufferRef};
use crate::plan::{AllocKind, AllocationPlan, ValueNameIdxMap};
use crate::provider::{no_fence, FencePtr, ProviderTable};
use crate::tensor::{required_bytes, DataType, Tensor, TensorShape};
use crate::value::{Value, ValueData, ValueType};

/// Ownership state of a slot's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferOwnership {
    /// Nothing materialized
    #[default]
    Unset,
    /// The slot allocated the buffer
    Owner,
    /// The buffer came from outside (`donor: None`) or from another slot
    Borrowed { donor: Option<usize> },
}

/// Runtime parameters of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationParams {
    pub shape: TensorShape,
}

impl AllocationParams {
    pub fn new(shape: impl Into<TensorShape>) -> Self {
        Self { shape: shape.into() }
    }
}

/// Value store of one run
pub struct ExecutionFrame {
    plan: Arc<AllocationPlan>,
    providers: Arc<ProviderTable>,
    values: Vec<Value>,
    ownership: Vec<BufferOwnership>,
    /// Value ids of every node's inputs then outputs, flattened
    node_values: Vec<Option<usize>>,
    /// `node_offsets[i]` is where node `i` starts in `node_values`
    node_offsets: Vec<usize>,
    node_input_counts: Vec<usize>,
}

impl ExecutionFrame {
    pub fn new(
        graph: &Graph,
        value_map: &ValueNameIdxMap,
        plan: Arc<AllocationPlan>,
        providers: Arc<ProviderTable>,
    ) -> Self {
        enforce!(
            plan.len() == value_map.len(),
            "allocation plan covers {} values, graph has {}",
            plan.len(),
            value_map.len()
        );

        let mut node_values = Vec::new();
        let mut node_offsets = Vec::with_capacity(graph.nodes().len());
        let mut node_input_counts = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            node_offsets.push(node_values.len());
            node_input_counts.push(node.input_names().len());
            node_values.extend(node.input_defs().map(|name| name.and_then(|n| value_map.get(n))));
            node_values.extend(node.output_names().iter().map(|n| value_map.get(n)));
        }

        let count = value_map.len();
        Self {
            plan,
            providers,
            values: vec![Value::default(); count],
            ownership: vec![BufferOwnership::Unset; count],
            node_values,
            node_offsets,
            node_input_counts,
        }
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn plan(&self) -> &AllocationPlan {
        &self.plan
    }

    pub fn providers(&self) -> &ProviderTable {
        &self.providers
    }

    fn check_id(&self, id: usize) {
        enforce!(
            id < self.values.len(),
            "value id {} out of range (frame has {} values)",
            id,
            self.values.len()
        );
    }

    pub fn value(&self, id: usize) -> &Value {
        self.check_id(id);
        &self.values[id]
    }

    pub(crate) fn value_mut(&mut self, id: usize) -> &mut Value {
        self.check_id(id);
        &mut self.values[id]
    }

    pub fn tensor(&self, id: usize) -> Option<&Tensor> {
        self.value(id).tensor()
    }

    pub fn ownership(&self, id: usize) -> BufferOwnership {
        self.check_id(id);
        self.ownership[id]
    }

    fn node_slice(&self, node_index: usize) -> &[Option<usize>] {
        enforce!(
            node_index < self.node_offsets.len(),
            "node index {} out of range",
            node_index
        );
        let start = self.node_offsets[node_index];
        let end = self
            .node_offsets
            .get(node_index + 1)
            .copied()
            .unwrap_or(self.node_values.len());
        &self.node_values[start..end]
    }

    /// Value ids of a node's inputs (`None` for omitted optional inputs)
    pub fn node_input_ids(&self, node_index: usize) -> &[Option<usize>] {
        let count = self.node_input_counts[node_index];
        &self.node_slice(node_index)[..count]
    }

    /// Value ids of a node's outputs
    pub fn node_output_ids(&self, node_index: usize) -> &[Option<usize>] {
        let count = self.node_input_counts[node_index];
        &self.node_slice(node_index)[count..]
    }

    /// Insert a feed or weight. The slot must be planned as pre-existing.
    pub fn insert_preexisting(&mut self, id: usize, mut value: Value) -> ForgeResult<()> {
        self.check_id(id);
        let entry = self.plan.entry(id);
        if entry.kind != AllocKind::PreExisting {
            return Err(ForgeError::InvalidPlan(format!(
                "value #{} is planned as {}, not pre-existing",
                id, entry.kind
            )));
        }
        if let Some(tensor) = value.tensor() {
            if entry.value_type != ValueType::Tensor(tensor.dtype()) {
                return Err(ForgeError::InvalidArgument(format!(
                    "value #{} expects {}, got tensor({})",
                    id,
                    entry.value_type,
                    tensor.dtype()
                )));
            }
        }
        if entry.create_fence {
            value.set_fence(self.create_fence(id)?);
        }
        self.values[id] = value;
        self.ownership[id] = BufferOwnership::Borrowed { donor: None };
        Ok(())
    }

    fn create_fence(&self, id: usize) -> ForgeResult<FencePtr> {
        let entry = self.plan.entry(id);
        match &entry.fence_provider {
            Some(provider) => Ok(self.providers.require(provider)?.create_fence()),
            None => Ok(no_fence()),
        }
    }

    /// Materialize `id` as its plan says. An already populated slot is left
    /// alone.
    pub fn allocate_as_per_allocation_plan(&mut self, id: usize, params: &AllocationParams) -> ForgeResult<()> {
        self.check_id(id);
        if self.values[id].is_allocated() {
            return Ok(());
        }

        let entry = self.plan.entry(id).clone();
        let dtype = match entry.value_type {
            ValueType::Tensor(dtype) => dtype,
            ValueType::NonTensor(kind) => {
                self.values[id].set_data(ValueData::NonTensor(kind.create()));
                self.ownership[id] = BufferOwnership::Owner;
                if entry.create_fence {
                    let fence = self.create_fence(id)?;
                    self.values[id].set_fence(fence);
                }
                return Ok(());
            }
        };

        match entry.kind {
            AllocKind::PreExisting => Err(ForgeError::InvalidPlan(format!(
                "value #{} is pre-existing and cannot be allocated by the frame",
                id
            ))),
            AllocKind::Allocate => {
                self.allocate_tensor_with_self_owned_buffer(id, dtype, params.shape.clone(), &entry.location)
            }
            AllocKind::Reuse { donor } => {
                if self.plan.entry(donor).kind != AllocKind::Allocate {
                    return Err(ForgeError::InvalidPlan(format!(
                        "value #{} reuses #{} which is not a frame allocation",
                        id, donor
                    )));
                }
                let buffer = match self.values.get(donor).and_then(Value::tensor) {
                    Some(tensor) if tensor.dtype() != dtype => {
                        return Err(ForgeError::InvalidPlan(format!(
                            "value #{} ({}) reuses #{} of element type {}",
                            id,
                            dtype,
                            donor,
                            tensor.dtype()
                        )))
                    }
                    Some(tensor) => tensor.buffer().clone(),
                    None => {
                        return Err(ForgeError::InvalidPlan(format!(
                            "value #{} reuses #{} which is not materialized",
                            id, donor
                        )))
                    }
                };
                self.allocate_tensor_with_preallocated_buffer(
                    id,
                    dtype,
                    params.shape.clone(),
                    buffer,
                    &entry.location,
                    Some(donor),
                )
            }
        }
    }

    /// Allocate a fresh buffer at `location` and make `id` its owner
    pub fn allocate_tensor_with_self_owned_buffer(
        &mut self,
        id: usize,
        dtype: DataType,
        shape: TensorShape,
        location: &AllocatorInfo,
    ) -> ForgeResult<()> {
        self.check_id(id);
        let allocator = self.providers.allocator_for(location).ok_or_else(|| {
            ForgeError::NotFound(format!("no allocator registered for {}", location))
        })?;
        let tensor = Tensor::allocate(allocator.as_ref(), dtype, shape)?;
        self.values[id].set_data(ValueData::Tensor(tensor));
        self.ownership[id] = BufferOwnership::Owner;
        if self.plan.entry(id).create_fence {
            let fence = self.create_fence(id)?;
            self.values[id].set_fence(fence);
        }
        Ok(())
    }

    /// Wrap `buffer` (owned by `donor`, or by the caller when `None`)
    pub fn allocate_tensor_with_preallocated_buffer(
        &mut self,
        id: usize,
        dtype: DataType,
        shape: TensorShape,
        buffer: BufferRef,
        location: &AllocatorInfo,
        donor: Option<usize>,
    ) -> ForgeResult<()> {
        self.check_id(id);
        let required = required_bytes(dtype, &shape)?;
        if buffer.size() < required {
            return Err(ForgeError::InvalidPlan(format!(
                "value #{} needs {} bytes, reused buffer has {}",
                id,
                required,
                buffer.size()
            )));
        }
        let tensor = Tensor::new_aliased(dtype, shape, buffer, location.clone())?;
        self.values[id].set_data(ValueData::Tensor(tensor));
        self.ownership[id] = BufferOwnership::Borrowed { donor };

        let donor_fence = donor
            .map(|d| self.values[d].fence().clone())
            .filter(|fence| !fence.is_noop());
        match donor_fence {
            Some(fence) => self.values[id].set_fence(fence),
            None if self.plan.entry(id).create_fence => {
                let fence = self.create_fence(id)?;
                self.values[id].set_fence(fence);
            }
            None => {}
        }
        Ok(())
    }

    /// Drop the slot's contents. Releasing an empty slot is a no-op; the
    /// buffer itself returns to its arena once the last reference is gone.
    pub fn release(&mut self, id: usize) {
        self.check_id(id);
        if self.values[id].is_allocated() {
            tracing::trace!("Releasing value #{}", id);
        }
        self.values[id].reset();
        self.ownership[id] = BufferOwnership::Unset;
    }

    /// Copy of a slot for the caller, without its fence
    pub fn fetch(&self, id: usize) -> Value {
        self.value(id).detached()
    }
}
