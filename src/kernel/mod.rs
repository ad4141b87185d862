//! Kernels and kernel dispatch
//!
//! A kernel is registered with a [`KernelDef`] describing which nodes it can
//! run (op type, domain, opset version range, provider, type constraints)
//! and a factory creating one [`OpKernel`] instance per node at session
//! initialization. Instances are shared by all runs and must be stateless
//! with respect to a single run.

pub mod def;
pub mod manager;
pub mod registry;

use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::executor::KernelContext;
use crate::graph::{AttributeValue, Attributes, Node};

pub use def::{KernelDef, KernelDefBuilder};
pub use manager::KernelRegistryManager;
pub use registry::{KernelCreateInfo, KernelRegistry};

/// A kernel instance bound to one node
pub trait OpKernel: Send + Sync {
    /// Run the node. Reads inputs and allocates outputs through `ctx`.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> ForgeResult<()>;
}

/// Kernel factory stored in a registry
pub type KernelCreateFn = Arc<dyn Fn(&OpKernelInfo) -> ForgeResult<Box<dyn OpKernel>> + Send + Sync>;

/// What a kernel factory knows about the node it builds for
#[derive(Debug, Clone)]
pub struct OpKernelInfo {
    node: Node,
    def: KernelDef,
}

impl OpKernelInfo {
    pub fn new(node: Node, def: KernelDef) -> Self {
        Self { node, def }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn kernel_def(&self) -> &KernelDef {
        &self.def
    }

    pub fn attributes(&self) -> &Attributes {
        self.node.attributes()
    }

    fn required(&self, name: &str) -> ForgeResult<&AttributeValue> {
        self.node.attribute(name).ok_or_else(|| {
            ForgeError::InvalidArgument(format!(
                "node {} is missing attribute '{}'",
                self.node, name
            ))
        })
    }

    fn wrong_kind(&self, name: &str, expected: &str) -> ForgeError {
        ForgeError::InvalidArgument(format!(
            "attribute '{}' of {} is not {}",
            name, self.node, expected
        ))
    }

    pub fn attr_f32(&self, name: &str) -> ForgeResult<f32> {
        self.required(name)?
            .as_float()
            .ok_or_else(|| self.wrong_kind(name, "a float"))
    }

    pub fn attr_i64(&self, name: &str) -> ForgeResult<i64> {
        self.required(name)?
            .as_int()
            .ok_or_else(|| self.wrong_kind(name, "an int"))
    }

    pub fn attr_f32_or(&self, name: &str, default: f32) -> ForgeResult<f32> {
        match self.node.attribute(name) {
            Some(value) => value.as_float().ok_or_else(|| self.wrong_kind(name, "a float")),
            None => Ok(default),
        }
    }

    pub fn attr_i64_or(&self, name: &str, default: i64) -> ForgeResult<i64> {
        match self.node.attribute(name) {
            Some(value) => value.as_int().ok_or_else(|| self.wrong_kind(name, "an int")),
            None => Ok(default),
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.node.attribute(name).and_then(AttributeValue::as_ints)
    }

    pub fn attr_strings(&self, name: &str) -> Option<&[String]> {
        self.node.attribute(name).and_then(AttributeValue::as_strings)
    }
}
