//! Kernel registry: kernel definitions keyed by op type and domain

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::graph::Node;
use crate::kernel::def::KernelDef;
use crate::kernel::{KernelCreateFn, OpKernel, OpKernelInfo};
use crate::provider::ProviderType;

/// A registered kernel: its definition and factory
#[derive(Clone)]
pub struct KernelCreateInfo {
    pub def: KernelDef,
    pub create: KernelCreateFn,
}

impl KernelCreateInfo {
    /// Instantiate the kernel for `node`
    pub fn instantiate(&self, node: &Node) -> ForgeResult<Box<dyn OpKernel>> {
        let info = OpKernelInfo::new(node.clone(), self.def.clone());
        (self.create)(&info)
    }
}

impl fmt::Debug for KernelCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCreateInfo")
            .field("def", &self.def.to_string())
            .finish()
    }
}

/// Collection of kernels; lookups are deterministic
#[derive(Debug, Default)]
pub struct KernelRegistry {
    /// (domain, op_type) → entries in registration order
    kernels: BTreeMap<(String, String), Vec<KernelCreateInfo>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel. Fails when an entry with the identical signature
    /// (op type, domain, provider, version range, type constraints) exists.
    pub fn register(&mut self, def: KernelDef, create: KernelCreateFn) -> ForgeResult<()> {
        let key = (def.domain().to_string(), def.op_type().to_string());
        let entries = self.kernels.entry(key).or_default();
        if entries.iter().any(|e| e.def.same_signature(&def)) {
            return Err(ForgeError::KernelRegistrationConflict(format!(
                "kernel {} is already registered",
                def
            )));
        }
        tracing::trace!("Registered kernel {}", def);
        entries.push(KernelCreateInfo { def, create });
        Ok(())
    }

    /// Register a kernel from a closure
    pub fn register_fn<F>(&mut self, def: KernelDef, create: F) -> ForgeResult<()>
    where
        F: Fn(&OpKernelInfo) -> ForgeResult<Box<dyn OpKernel>> + Send + Sync + 'static,
    {
        self.register(def, std::sync::Arc::new(create))
    }

    /// The unique kernel able to run `node` on `provider`.
    ///
    /// `Ok(None)` when nothing matches, `AmbiguousKernel` when several do.
    pub fn try_find(&self, node: &Node, provider: &ProviderType) -> ForgeResult<Option<&KernelCreateInfo>> {
        let key = (node.op_domain().to_string(), node.op_type().to_string());
        let Some(entries) = self.kernels.get(&key) else {
            return Ok(None);
        };

        let mut matches = entries.iter().filter(|e| e.def.matches(node, provider));
        let first = matches.next();
        if let Some(second) = matches.next() {
            return Err(ForgeError::AmbiguousKernel(format!(
                "{} on {} matches both {} and {}",
                node, provider, first.map(|e| e.def.to_string()).unwrap_or_default(), second.def
            )));
        }
        Ok(first)
    }

    pub fn len(&self) -> usize {
        self.kernels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All definitions, ordered by (domain, op type) then registration
    pub fn defs(&self) -> impl Iterator<Item = &KernelDef> {
        self.kernels.values().flatten().map(|e| &e.def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::KernelContext;
    use crate::kernel::def::KernelDefBuilder;
    use crate::tensor::DataType;

    struct Noop;

    impl OpKernel for Noop {
        fn compute(&self, _ctx: &mut KernelContext<'_>) -> ForgeResult<()> {
            Ok(())
        }
    }

    fn noop(_: &OpKernelInfo) -> ForgeResult<Box<dyn OpKernel>> {
        Ok(Box::new(Noop))
    }

    fn relu_def(since: u32, end: u32, types: &[DataType]) -> KernelDef {
        KernelDefBuilder::new("Relu")
            .version_range(since, end)
            .type_constraint("T", types.iter().copied())
            .build()
    }

    fn relu_node(version: u32) -> Node {
        Node::new("Relu").version(version).bind_type("T", DataType::F32)
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let mut registry = KernelRegistry::new();
        registry.register_fn(relu_def(1, 12, &[DataType::F32]), noop).unwrap();
        let err = registry
            .register_fn(relu_def(1, 12, &[DataType::F32]), noop)
            .unwrap_err();
        assert!(matches!(err, ForgeError::KernelRegistrationConflict(_)));
        assert_eq!(registry.len(), 1);

        // Different version range is a different signature
        registry.register_fn(relu_def(13, u32::MAX, &[DataType::F32]), noop).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_try_find_by_version() {
        let mut registry = KernelRegistry::new();
        registry.register_fn(relu_def(1, 12, &[DataType::F32]), noop).unwrap();
        registry.register_fn(relu_def(13, u32::MAX, &[DataType::F32]), noop).unwrap();

        let found = registry.try_find(&relu_node(11), &ProviderType::CPU).unwrap().unwrap();
        assert_eq!(found.def.version_range(), (1, 12));
        let found = registry.try_find(&relu_node(14), &ProviderType::CPU).unwrap().unwrap();
        assert_eq!(found.def.version_range(), (13, u32::MAX));
        assert!(registry.try_find(&relu_node(14), &ProviderType::STREAM).unwrap().is_none());
        assert!(registry
            .try_find(&Node::new("Sigmoid").version(13), &ProviderType::CPU)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_ambiguous_match() {
        let mut registry = KernelRegistry::new();
        registry.register_fn(relu_def(1, 13, &[DataType::F32]), noop).unwrap();
        registry
            .register_fn(relu_def(10, 20, &[DataType::F32, DataType::F64]), noop)
            .unwrap();

        let err = registry.try_find(&relu_node(12), &ProviderType::CPU).unwrap_err();
        assert!(matches!(err, ForgeError::AmbiguousKernel(_)));
        // Outside the overlap only one matches
        assert!(registry.try_find(&relu_node(5), &ProviderType::CPU).unwrap().is_some());
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let mut registry = KernelRegistry::new();
        registry.register_fn(relu_def(1, 12, &[DataType::F32]), noop).unwrap();
        registry.register_fn(relu_def(13, u32::MAX, &[DataType::F32]), noop).unwrap();
        for _ in 0..10 {
            let found = registry.try_find(&relu_node(13), &ProviderType::CPU).unwrap().unwrap();
            assert_eq!(found.def.version_range().0, 13);
        }
    }
}
