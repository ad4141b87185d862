//! Layered kernel lookup
//!
//! Custom registries form overlays above the providers' built-in registries.
//! Overlays are consulted in registration order and the first one with a
//! match wins; the built-in registry of the node's provider is only searched
//! when no overlay matches. Results are never merged.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ForgeError, ForgeResult};
use crate::graph::Node;
use crate::kernel::registry::{KernelCreateInfo, KernelRegistry};
use crate::kernel::OpKernel;
use crate::provider::{ProviderTable, ProviderType};

#[derive(Debug, Default, Clone)]
pub struct KernelRegistryManager {
    custom: Vec<Arc<KernelRegistry>>,
    builtin: HashMap<ProviderType, Arc<KernelRegistry>>,
}

impl KernelRegistryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an overlay registry (searched before earlier built-ins, after
    /// earlier overlays)
    pub fn register_custom_registry(&mut self, registry: Arc<KernelRegistry>) {
        self.custom.push(registry);
    }

    pub fn register_provider_registry(&mut self, provider: ProviderType, registry: Arc<KernelRegistry>) {
        self.builtin.insert(provider, registry);
    }

    /// Take the built-in registry of every provider in `providers`
    pub fn register_providers(&mut self, providers: &ProviderTable) {
        for provider in providers.iter() {
            self.register_provider_registry(provider.provider_type().clone(), provider.kernel_registry());
        }
    }

    pub fn custom_registries(&self) -> &[Arc<KernelRegistry>] {
        &self.custom
    }

    /// Kernel for `node` on `provider`, or `None`
    pub fn search(&self, node: &Node, provider: &ProviderType) -> ForgeResult<Option<&KernelCreateInfo>> {
        for (layer, registry) in self.custom.iter().enumerate() {
            if let Some(found) = registry.try_find(node, provider)? {
                tracing::debug!("{} resolved by custom registry #{}: {}", node, layer, found.def);
                return Ok(Some(found));
            }
        }
        match self.builtin.get(provider) {
            Some(registry) => registry.try_find(node, provider),
            None => Ok(None),
        }
    }

    /// Kernel for `node` on its assigned provider
    pub fn find(&self, node: &Node) -> ForgeResult<&KernelCreateInfo> {
        let provider = node.assigned_provider().ok_or_else(|| {
            ForgeError::KernelNotFound(format!("{} has no assigned execution provider", node))
        })?;
        self.search(node, provider)?.ok_or_else(|| {
            ForgeError::KernelNotFound(format!(
                "{} with bindings {:?} on {}",
                node,
                node.type_bindings(),
                provider
            ))
        })
    }

    /// Instantiate the kernel for `node`
    pub fn create_kernel(&self, node: &Node) -> ForgeResult<Box<dyn OpKernel>> {
        self.find(node)?.instantiate(node)
    }
}
