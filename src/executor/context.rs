//! What a kernel sees while it runs

use std::sync::{Arc, Mutex};

use crate::enforce;
use crate::error::{contract_violation, ForgeError, ForgeResult};
use crate::executor::frame::{AllocationParams, ExecutionFrame};
use crate::graph::{AttributeValue, Attributes, Node};
use crate::provider::ProviderType;
use crate::tensor::{Tensor, TensorShape};
use crate::value::{NonTensorValue, Value};

/// First error raised by work an asynchronous kernel left running
///
/// Asynchronous kernels return before their work completes; the work reports
/// failures here and the executor checks after synchronizing.
#[derive(Debug, Clone, Default)]
pub struct AsyncStatus(Arc<Mutex<Option<ForgeError>>>);

impl AsyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `err` unless an earlier error was recorded
    pub fn record(&self, err: ForgeError) {
        match self.0.lock() {
            Ok(mut slot) => {
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
            Err(poisoned) => {
                let mut slot = poisoned.into_inner();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
    }

    /// The recorded error, if any
    pub fn check(&self) -> ForgeResult<()> {
        match self.0.lock()?.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.check().is_ok()
    }
}

/// Kernel view of the frame for one node
pub struct KernelContext<'a> {
    frame: &'a mut ExecutionFrame,
    node: &'a Node,
    provider: &'a ProviderType,
    queue_id: usize,
    async_status: &'a AsyncStatus,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        frame: &'a mut ExecutionFrame,
        node: &'a Node,
        provider: &'a ProviderType,
        queue_id: usize,
        async_status: &'a AsyncStatus,
    ) -> Self {
        Self {
            frame,
            node,
            provider,
            queue_id,
            async_status,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn attributes(&self) -> &Attributes {
        self.node.attributes()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.node.attribute(name)
    }

    /// Provider the kernel runs on
    pub fn provider(&self) -> &ProviderType {
        self.provider
    }

    pub fn queue_id(&self) -> usize {
        self.queue_id
    }

    /// Status sink for work that outlives `compute`
    pub fn async_status(&self) -> AsyncStatus {
        self.async_status.clone()
    }

    pub fn input_count(&self) -> usize {
        self.frame.node_input_ids(self.node.index()).len()
    }

    pub fn output_count(&self) -> usize {
        self.frame.node_output_ids(self.node.index()).len()
    }

    fn input_id(&self, index: usize) -> Option<usize> {
        let ids = self.frame.node_input_ids(self.node.index());
        enforce!(
            index < ids.len(),
            "{} has {} inputs, input {} requested",
            self.node,
            ids.len(),
            index
        );
        ids[index]
    }

    /// Input slot `index` as stored in the frame, or `None` when the
    /// optional input is omitted
    pub fn input_value(&self, index: usize) -> Option<&Value> {
        self.input_id(index).map(|id| self.frame.value(id))
    }

    /// Optional tensor input
    pub fn optional_input(&self, index: usize) -> Option<Tensor> {
        self.input_value(index).and_then(Value::tensor).cloned()
    }

    /// Required tensor input. A missing or unmaterialized input is a
    /// contract violation.
    pub fn input(&self, index: usize) -> Tensor {
        match self.input_value(index).and_then(Value::tensor) {
            Some(tensor) => tensor.clone(),
            None => contract_violation(format!(
                "required input {} of {} is missing or not a tensor",
                index, self.node
            )),
        }
    }

    fn output_id(&self, index: usize) -> ForgeResult<usize> {
        let ids = self.frame.node_output_ids(self.node.index());
        ids.get(index).copied().flatten().ok_or_else(|| {
            ForgeError::InvalidArgument(format!("{} has no output {}", self.node, index))
        })
    }

    /// Materialize output `index` with `shape` and return it.
    ///
    /// A slot populated before the kernel ran (for example by a caller
    /// supplied buffer) must already have `shape`.
    pub fn output(&mut self, index: usize, shape: impl Into<TensorShape>) -> ForgeResult<Tensor> {
        let shape = shape.into();
        let id = self.output_id(index)?;
        let fresh = !self.frame.value(id).is_allocated();
        self.frame
            .allocate_as_per_allocation_plan(id, &AllocationParams::new(shape.clone()))?;
        if fresh {
            self.frame
                .value(id)
                .fence()
                .before_using_as_output(self.provider, self.queue_id)?;
        }

        let tensor = self.frame.tensor(id).cloned().ok_or_else(|| {
            ForgeError::InvalidArgument(format!("output {} of {} is not a tensor", index, self.node))
        })?;
        if *tensor.shape() != shape {
            return Err(ForgeError::InvalidArgument(format!(
                "output {} of {} has shape {}, kernel produced {}",
                index,
                self.node,
                tensor.shape(),
                shape
            )));
        }
        Ok(tensor)
    }

    /// Materialize a non-tensor output and hand it out for filling
    pub fn output_non_tensor(&mut self, index: usize) -> ForgeResult<&mut NonTensorValue> {
        let id = self.output_id(index)?;
        let fresh = !self.frame.value(id).is_allocated();
        self.frame
            .allocate_as_per_allocation_plan(id, &AllocationParams::new(TensorShape::scalar()))?;
        if fresh {
            self.frame
                .value(id)
                .fence()
                .before_using_as_output(self.provider, self.queue_id)?;
        }
        let node = self.node;
        self.frame
            .value_mut(id)
            .non_tensor_mut()
            .ok_or_else(|| ForgeError::InvalidArgument(format!("output {} of {} is a tensor", index, node)))
    }
}
