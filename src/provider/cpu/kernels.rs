//! Reference kernels of the CPU provider

use crate::error::{ForgeError, ForgeResult};
use crate::executor::KernelContext;
use crate::graph::ML_DOMAIN;
use crate::kernel::{KernelDefBuilder, KernelRegistry, OpKernel, OpKernelInfo};
use crate::ops::{
    binary_into, binary_output_shape, copy_into, hardmax_into, matmul_into, matmul_output_shape, unary_into,
    zipmap, BinaryOp, ClassLabels, UnaryOp,
};
use crate::tensor::DataType;

const NUMERIC: [DataType; 4] = [DataType::F32, DataType::F64, DataType::I32, DataType::I64];
const FLOATS: [DataType; 3] = [DataType::F32, DataType::F64, DataType::F16];

fn boxed<K: OpKernel + 'static>(kernel: K) -> ForgeResult<Box<dyn OpKernel>> {
    Ok(Box::new(kernel))
}

/// Register every built-in CPU kernel into `registry`
pub fn register_kernels(registry: &mut KernelRegistry) -> ForgeResult<()> {
    for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul] {
        registry.register_fn(
            KernelDefBuilder::new(op.name())
                .since_version(7)
                .type_constraint("T", NUMERIC)
                .may_inplace_if_fits(0, 0)
                .build(),
            move |_: &OpKernelInfo| boxed(Binary(op)),
        )?;
    }

    registry.register_fn(
        KernelDefBuilder::new("Relu")
            .since_version(6)
            .type_constraint("T", FLOATS)
            .may_inplace(0, 0)
            .build(),
        |_: &OpKernelInfo| boxed(Unary(UnaryOp::Relu)),
    )?;
    registry.register_fn(
        KernelDefBuilder::new("Sigmoid")
            .since_version(6)
            .type_constraint("T", FLOATS)
            .may_inplace(0, 0)
            .build(),
        |_: &OpKernelInfo| boxed(Unary(UnaryOp::Sigmoid)),
    )?;
    registry.register_fn(
        KernelDefBuilder::new("Scale")
            .type_constraint("T", FLOATS)
            .may_inplace(0, 0)
            .build(),
        |info: &OpKernelInfo| boxed(Unary(UnaryOp::Scale(info.attr_f32_or("scale", 1.0)?))),
    )?;

    registry.register_fn(
        KernelDefBuilder::new("Identity")
            .type_constraint("T", DataType::ALL)
            .may_inplace(0, 0)
            .build(),
        |_: &OpKernelInfo| boxed(Identity),
    )?;

    for (since, end) in [(1, 12), (13, u32::MAX)] {
        registry.register_fn(
            KernelDefBuilder::new("MatMul")
                .version_range(since, end)
                .type_constraint("T", [DataType::F32, DataType::F64])
                .build(),
            |_: &OpKernelInfo| boxed(MatMul),
        )?;
    }

    registry.register_fn(
        KernelDefBuilder::new("Hardmax")
            .version_range(1, 12)
            .type_constraint("T", FLOATS)
            .build(),
        |info: &OpKernelInfo| {
            boxed(Hardmax {
                axis: info.attr_i64_or("axis", 1)?,
                coerced: true,
            })
        },
    )?;
    registry.register_fn(
        KernelDefBuilder::new("Hardmax")
            .since_version(13)
            .type_constraint("T", FLOATS)
            .build(),
        |info: &OpKernelInfo| {
            boxed(Hardmax {
                axis: info.attr_i64_or("axis", -1)?,
                coerced: false,
            })
        },
    )?;

    registry.register_fn(
        KernelDefBuilder::new("ZipMap")
            .domain(ML_DOMAIN)
            .type_constraint("T", [DataType::F32])
            .build(),
        |info: &OpKernelInfo| boxed(ZipMap::new(info)?),
    )?;

    Ok(())
}

/// Add / Sub / Mul with broadcasting
pub struct Binary(pub BinaryOp);

impl OpKernel for Binary {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let a = ctx.input(0);
        let b = ctx.input(1);
        let out = ctx.output(0, binary_output_shape(&a, &b)?)?;
        binary_into(self.0, &a, &b, &out)
    }
}

/// Relu / Sigmoid / Scale
pub struct Unary(pub UnaryOp);

impl OpKernel for Unary {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let out = ctx.output(0, x.shape().clone())?;
        unary_into(self.0, &x, &out)
    }
}

pub struct Identity;

impl OpKernel for Identity {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let out = ctx.output(0, x.shape().clone())?;
        copy_into(&x, &out)
    }
}

pub struct MatMul;

impl OpKernel for MatMul {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let a = ctx.input(0);
        let b = ctx.input(1);
        let out = ctx.output(0, matmul_output_shape(&a, &b)?)?;
        matmul_into(&a, &b, &out)
    }
}

pub struct Hardmax {
    axis: i64,
    coerced: bool,
}

impl OpKernel for Hardmax {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let out = ctx.output(0, x.shape().clone())?;
        hardmax_into(&x, self.axis, self.coerced, &out)
    }
}

/// Scores to a label → score map (one row)
pub struct ZipMap {
    labels: ClassLabels,
}

impl ZipMap {
    fn new(info: &OpKernelInfo) -> ForgeResult<Self> {
        let strings = info.attr_strings("classlabels_strings");
        let ints = info.attr_ints("classlabels_int64s");
        let labels = match (strings, ints) {
            (Some(names), None) => ClassLabels::Strings(names.to_vec()),
            (None, Some(ids)) => ClassLabels::Ints(ids.to_vec()),
            _ => {
                return Err(ForgeError::InvalidArgument(format!(
                    "{} needs exactly one of classlabels_strings and classlabels_int64s",
                    info.node()
                )))
            }
        };
        Ok(Self { labels })
    }
}

impl OpKernel for ZipMap {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
        let x = ctx.input(0);
        let map = zipmap(&x.to_vec::<f32>()?, x.shape(), &self.labels)?;
        let slot = ctx.output_non_tensor(0)?;
        if slot.value_type() != map.value_type() {
            return Err(ForgeError::InvalidArgument(format!(
                "ZipMap output is declared {:?}, labels produce {:?}",
                slot.value_type(),
                map.value_type()
            )));
        }
        *slot = map;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::provider::ProviderType;

    fn registry() -> KernelRegistry {
        let mut registry = KernelRegistry::new();
        register_kernels(&mut registry).unwrap();
        registry
    }

    #[test]
    fn test_registration_is_conflict_free() {
        let mut registry = registry();
        // A second pass collides with every signature
        assert!(register_kernels(&mut registry).is_err());
    }

    #[test]
    fn test_version_split_resolves_uniquely() {
        let registry = registry();
        for version in [9, 13] {
            let node = Node::new("MatMul").version(version).bind_type("T", DataType::F32);
            let found = registry.try_find(&node, &ProviderType::CPU).unwrap().unwrap();
            assert!(found.def.covers_version(version));
        }
        let hardmax_11 = Node::new("Hardmax").version(11).bind_type("T", DataType::F32);
        let found = registry.try_find(&hardmax_11, &ProviderType::CPU).unwrap().unwrap();
        assert_eq!(found.def.version_range(), (1, 12));
    }

    #[test]
    fn test_zipmap_requires_labels() {
        let registry = registry();
        let node = Node::new("ZipMap")
            .domain(ML_DOMAIN)
            .version(1)
            .bind_type("T", DataType::F32);
        let found = registry.try_find(&node, &ProviderType::CPU).unwrap().unwrap();
        assert!(found.instantiate(&node).is_err());

        let labelled = node.attr("classlabels_int64s", vec![1i64, 2]);
        assert!(found.instantiate(&labelled).is_ok());
    }

    #[test]
    fn test_integer_relu_not_supported() {
        let registry = registry();
        let node = Node::new("Relu").version(14).bind_type("T", DataType::I32);
        assert!(registry.try_find(&node, &ProviderType::CPU).unwrap().is_none());
    }
}
