//! Kernel definitions: what a kernel can run and how its memory is laid out

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::graph::{Node, DEFAULT_DOMAIN};
use crate::memory::MemType;
use crate::provider::ProviderType;
use crate::tensor::DataType;

/// Signature and memory properties of a kernel implementation
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDef {
    op_type: String,
    domain: String,
    since_version: u32,
    end_version: u32,
    provider: ProviderType,
    type_constraints: BTreeMap<String, BTreeSet<DataType>>,
    inplace: Vec<(usize, usize)>,
    inplace_if_fits: Vec<(usize, usize)>,
    input_mem_types: BTreeMap<usize, MemType>,
    output_mem_types: BTreeMap<usize, MemType>,
}

impl KernelDef {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Inclusive opset version range
    pub fn version_range(&self) -> (u32, u32) {
        (self.since_version, self.end_version)
    }

    pub fn provider(&self) -> &ProviderType {
        &self.provider
    }

    pub fn type_constraints(&self) -> &BTreeMap<String, BTreeSet<DataType>> {
        &self.type_constraints
    }

    /// `(input, output)` pairs whose buffers may be shared. The output
    /// always has the shape of the input.
    pub fn may_inplace(&self) -> &[(usize, usize)] {
        &self.inplace
    }

    /// `(input, output)` pairs whose buffers may be shared when the output
    /// is known not to outgrow the input (broadcasting kernels)
    pub fn may_inplace_if_fits(&self) -> &[(usize, usize)] {
        &self.inplace_if_fits
    }

    pub fn input_memory_type(&self, index: usize) -> MemType {
        self.input_mem_types.get(&index).copied().unwrap_or_default()
    }

    pub fn output_memory_type(&self, index: usize) -> MemType {
        self.output_mem_types.get(&index).copied().unwrap_or_default()
    }

    /// True if `version` lies in the kernel's version range
    pub fn covers_version(&self, version: u32) -> bool {
        self.since_version <= version && version <= self.end_version
    }

    /// True if every constrained type parameter is bound to an allowed type
    pub fn satisfies(&self, bindings: &BTreeMap<String, DataType>) -> bool {
        self.type_constraints.iter().all(|(param, allowed)| {
            bindings
                .get(param)
                .map(|dtype| allowed.contains(dtype))
                .unwrap_or(false)
        })
    }

    /// True if this kernel can run `node` on `provider`
    pub fn matches(&self, node: &Node, provider: &ProviderType) -> bool {
        self.provider == *provider
            && self.op_type == node.op_type()
            && self.domain == node.op_domain()
            && self.covers_version(node.since_version())
            && self.satisfies(node.type_bindings())
    }

    /// Two definitions with the same signature cannot share a registry
    pub fn same_signature(&self, other: &KernelDef) -> bool {
        self.op_type == other.op_type
            && self.domain == other.domain
            && self.provider == other.provider
            && self.since_version == other.since_version
            && self.end_version == other.end_version
            && self.type_constraints == other.type_constraints
    }
}

impl fmt::Display for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = if self.end_version == u32::MAX {
            "*".to_string()
        } else {
            self.end_version.to_string()
        };
        write!(
            f,
            "{}{}{} [{}, {}] on {}",
            self.domain,
            if self.domain.is_empty() { "" } else { "." },
            self.op_type,
            self.since_version,
            end,
            self.provider
        )?;
        for (param, allowed) in &self.type_constraints {
            let names: Vec<&str> = allowed.iter().map(DataType::name).collect();
            write!(f, " {}={{{}}}", param, names.join(","))?;
        }
        Ok(())
    }
}

/// Builder for [`KernelDef`]
#[derive(Debug, Clone)]
pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            def: KernelDef {
                op_type: op_type.into(),
                domain: DEFAULT_DOMAIN.to_string(),
                since_version: 1,
                end_version: u32::MAX,
                provider: ProviderType::CPU,
                type_constraints: BTreeMap::new(),
                inplace: Vec::new(),
                inplace_if_fits: Vec::new(),
                input_mem_types: BTreeMap::new(),
                output_mem_types: BTreeMap::new(),
            },
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.def.domain = domain.into();
        self
    }

    /// Open-ended range starting at `version`
    pub fn since_version(mut self, version: u32) -> Self {
        self.def.since_version = version;
        self.def.end_version = u32::MAX;
        self
    }

    /// Closed range `[since, end]`
    pub fn version_range(mut self, since: u32, end: u32) -> Self {
        self.def.since_version = since;
        self.def.end_version = end;
        self
    }

    pub fn provider(mut self, provider: ProviderType) -> Self {
        self.def.provider = provider;
        self
    }

    pub fn type_constraint<I>(mut self, param: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = DataType>,
    {
        self.def
            .type_constraints
            .entry(param.into())
            .or_default()
            .extend(allowed);
        self
    }

    pub fn may_inplace(mut self, input: usize, output: usize) -> Self {
        self.def.inplace.push((input, output));
        self
    }

    /// Like [`may_inplace`](Self::may_inplace) for kernels whose output can
    /// be larger than `input`. The planner only shares the buffer when the
    /// graph declares both shapes and the output fits.
    pub fn may_inplace_if_fits(mut self, input: usize, output: usize) -> Self {
        self.def.inplace_if_fits.push((input, output));
        self
    }

    pub fn input_memory_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.input_mem_types.insert(index, mem_type);
        self
    }

    pub fn output_memory_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.output_mem_types.insert(index, mem_type);
        self
    }

    pub fn build(self) -> KernelDef {
        self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu_node(version: u32, dtype: DataType) -> Node {
        // Built standalone: bindings are set explicitly
        Node::new("Relu").version(version).bind_type("T", dtype)
    }

    #[test]
    fn test_version_and_types() {
        let def = KernelDefBuilder::new("Relu")
            .version_range(6, 12)
            .type_constraint("T", [DataType::F32, DataType::F64])
            .build();

        assert!(def.matches(&relu_node(6, DataType::F32), &ProviderType::CPU));
        assert!(def.matches(&relu_node(12, DataType::F64), &ProviderType::CPU));
        assert!(!def.matches(&relu_node(13, DataType::F32), &ProviderType::CPU));
        assert!(!def.matches(&relu_node(6, DataType::I32), &ProviderType::CPU));
        assert!(!def.matches(&relu_node(6, DataType::F32), &ProviderType::STREAM));
    }

    #[test]
    fn test_unbound_param_does_not_satisfy() {
        let def = KernelDefBuilder::new("Relu")
            .type_constraint("T", [DataType::F32])
            .build();
        assert!(!def.matches(&Node::new("Relu").version(13), &ProviderType::CPU));
    }

    #[test]
    fn test_signature_ignores_memory_properties() {
        let a = KernelDefBuilder::new("Add")
            .type_constraint("T", [DataType::F32])
            .build();
        let b = KernelDefBuilder::new("Add")
            .type_constraint("T", [DataType::F32])
            .may_inplace(0, 0)
            .output_memory_type(0, MemType::CpuOutput)
            .build();
        assert!(a.same_signature(&b));
        assert_eq!(b.output_memory_type(0), MemType::CpuOutput);
        assert_eq!(b.output_memory_type(1), MemType::Default);
    }

    #[test]
    fn test_display() {
        let def = KernelDefBuilder::new("MatMul")
            .version_range(1, 12)
            .type_constraint("T", [DataType::F32])
            .build();
        assert_eq!(def.to_string(), "MatMul [1, 12] on CPUExecutionProvider T={float32}");
    }
}
