//! Kernels of the stream provider
//!
//! `compute` runs on the executor thread: it reads input shapes, allocates
//! outputs, and enqueues the actual work on the device queue. Errors raised
//! by the work are reported through the run's [`AsyncStatus`].

use std::sync::Arc;

use crate::error::ForgeResult;
use crate::executor::{AsyncStatus, KernelContext};
use crate::graph::partition::{MEMCPY_FROM_HOST, MEMCPY_TO_HOST};
use crate::graph::INTERNAL_DOMAIN;
use crate::kernel::{KernelDefBuilder, KernelRegistry, OpKernel, OpKernelInfo};
use crate::memory::MemType;
use crate::ops::{
    binary_into, binary_output_shape, copy_into, matmul_into, matmul_output_shape, unary_into, BinaryOp,
    UnaryOp,
};
use crate::provider::stream::queue::DeviceQueue;
use crate::provider::ProviderType;
use crate::tensor::DataType;

const NUMERIC: [DataType; 4] = [DataType::F32, DataType::F64, DataType::I32, DataType::I64];
const FLOATS: [DataType; 3] = [DataType::F32, DataType::F64, DataType::F16];

/// Hand `work` to the queue; its failure is recorded against `node`
fn enqueue<F>(queue: &DeviceQueue, ctx: &KernelContext<'_>, work: F) -> ForgeResult<()>
where
    F: FnOnce() -> ForgeResult<()> + Send + 'static,
{
    let status: AsyncStatus = ctx.async_status();
    let node = ctx.node().node_name().to_string();
    queue.submit(move || {
        if let Err(err) = work() {
            tracing::error!("Queued work of '{}' failed: {}", node, err);
            status.record(err.in_node(node));
        }
    })
}

/// Register the stream kernels for `provider`, all submitting to `queue`
pub fn register_kernels(
    registry: &mut KernelRegistry,
    provider: &ProviderType,
    queue: &Arc<DeviceQueue>,
) -> ForgeResult<()> {
    for op in [BinaryOp::Add, BinaryOp::Mul] {
        let q = Arc::clone(queue);
        registry.register_fn(
            KernelDefBuilder::new(op.name())
                .since_version(7)
                .provider(provider.clone())
                .type_constraint("T", NUMERIC)
                .may_inplace_if_fits(0, 0)
                .build(),
            move |_: &OpKernelInfo| {
                Ok(Box::new(StreamBinary {
                    op,
                    queue: Arc::clone(&q),
                }) as Box<dyn OpKernel>)
            },
        )?;
    }

    let q = Arc::clone(queue);
    registry.register_fn(
        KernelDefBuilder::new("Relu")
            .since_version(6)
            .provider(provider.clone())
            .type_constraint("T", FLOATS)
            .may_inplace(0, 0)
            .build(),
        move |_: &OpKernelInfo| Ok(Box::new(StreamRelu(Arc::clone(&q))) as Box<dyn OpKernel>),
    )?;

    let q = Arc::clone(queue);
    registry.register_fn(
        KernelDefBuilder::new("MatMul")
            .provider(provider.clone())
            .type_constraint("T", [DataType::F32, DataType::F64])
            .build(),
        move |_: &OpKernelInfo| Ok(Box::new(StreamMatMul(Arc::clone(&q))) as Box<dyn OpKernel>),
    )?;

    let q = Arc::clone(queue);
    registry.register_fn(
        KernelDefBuilder::new(MEMCPY_FROM_HOST)
            .domain(INTERNAL_DOMAIN)
            .provider(provider.clone())
            .type_constraint("T", DataType::ALL)
            .input_memory_type(0, MemType::CpuInput)
            .build(),
        move |_: &OpKernelInfo| Ok(Box::new(StreamCopy(Arc::clone(&q))) as Box<dyn OpKernel>),
    )?;

    let q = Arc::clone(queue);
    registry.register_fn(
        KernelDefBuilder::new(MEMCPY_TO_HOST)
            .domain(INTERNAL_DOMAIN)
            .provider(provider.clone())
            .type_constraint("T", DataType::ALL)
            .output_memory_type(0, MemType::CpuOutput)
            .build(),
        move |_: &OpKernelInfo| Ok(Box::new(StreamCopy(Arc::clone(&q))) as Box<dyn OpKernel>),
    )?;

    Ok(())
}

pub struct StreamBinary {
    op: BinaryOp,
    queue: Arc<DeviceQueue>,
}

impl OpKernel for StreamBinary {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let a = ctx.input(0);
        let b = ctx.input(1);
        let out = ctx.output(0, binary_output_shape(&a, &b)?)?;
        let op = self.op;
        enqueue(&self.queue, ctx, move || binary_into(op, &a, &b, &out))
    }
}

pub struct StreamRelu(Arc<DeviceQueue>);

impl OpKernel for StreamRelu {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let out = ctx.output(0, x.shape().clone())?;
        enqueue(&self.0, ctx, move || unary_into(UnaryOp::Relu, &x, &out))
    }
}

pub struct StreamMatMul(Arc<DeviceQueue>);

impl OpKernel for StreamMatMul {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let a = ctx.input(0);
        let b = ctx.input(1);
        let out = ctx.output(0, matmul_output_shape(&a, &b)?)?;
        enqueue(&self.0, ctx, move || matmul_into(&a, &b, &out))
    }
}

/// Host to device and device to host copies
pub struct StreamCopy(Arc<DeviceQueue>);

impl OpKernel for StreamCopy {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let src = ctx.input(0);
        let out = ctx.output(0, src.shape().clone())?;
        enqueue(&self.0, ctx, move || copy_into(&src, &out))
    }
}
