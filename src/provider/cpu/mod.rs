//! Host execution provider
//!
//! Synchronous: a kernel's work is complete when `compute` returns, so the
//! provider never creates fences of its own. Memory comes from one slab
//! arena registered as the `Cpu` location.

pub mod kernels;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ForgeResult;
use crate::kernel::KernelRegistry;
use crate::memory::{AllocatorInfo, AllocatorKind, AllocatorPtr, ArenaAllocator, MemType, SlabArena};
use crate::provider::{ExecutionProvider, ProviderType};

/// Configuration for the CPU provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuProviderConfig {
    /// Upper bound on live arena bytes; `None` means unbounded
    pub arena_capacity: Option<usize>,
    /// Freed buffers kept per size class
    pub max_pool_size: usize,
    pub device_id: i32,
}

impl Default for CpuProviderConfig {
    fn default() -> Self {
        Self {
            arena_capacity: None,
            max_pool_size: SlabArena::DEFAULT_MAX_POOL_SIZE,
            device_id: 0,
        }
    }
}

impl CpuProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = Some(bytes);
        self
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }
}

/// Synchronous host provider
#[derive(Debug)]
pub struct CpuExecutionProvider {
    provider_type: ProviderType,
    config: CpuProviderConfig,
    allocator: Arc<ArenaAllocator>,
    registry: Arc<KernelRegistry>,
}

impl CpuExecutionProvider {
    pub fn new(config: CpuProviderConfig) -> ForgeResult<Self> {
        let info = AllocatorInfo::new("Cpu", AllocatorKind::Arena, config.device_id, MemType::Default);
        let arena = Arc::new(SlabArena::with_limits(config.arena_capacity, config.max_pool_size));
        let mut registry = KernelRegistry::new();
        kernels::register_kernels(&mut registry)?;
        tracing::debug!(
            "CPU provider ready: {} kernels, arena capacity {:?}",
            registry.len(),
            config.arena_capacity
        );
        Ok(Self {
            provider_type: ProviderType::CPU,
            config,
            allocator: Arc::new(ArenaAllocator::with_arena(info, arena)),
            registry: Arc::new(registry),
        })
    }

    pub fn config(&self) -> &CpuProviderConfig {
        &self.config
    }

    /// The host arena
    pub fn arena(&self) -> &Arc<SlabArena> {
        self.allocator.arena()
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        let allocator = Arc::new(ArenaAllocator::new(AllocatorInfo::cpu()));
        let mut registry = KernelRegistry::new();
        // Built-in signatures are distinct, registration cannot conflict
        if let Err(err) = kernels::register_kernels(&mut registry) {
            tracing::error!("CPU kernel registration failed: {}", err);
        }
        Self {
            provider_type: ProviderType::CPU,
            config: CpuProviderConfig::default(),
            allocator,
            registry: Arc::new(registry),
        }
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_type(&self) -> &ProviderType {
        &self.provider_type
    }

    fn allocator(&self, mem_type: MemType) -> Option<AllocatorPtr> {
        match mem_type {
            MemType::Default => Some(self.allocator.clone() as AllocatorPtr),
            MemType::CpuInput | MemType::CpuOutput => None,
        }
    }

    fn allocators(&self) -> Vec<AllocatorPtr> {
        vec![self.allocator.clone() as AllocatorPtr]
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForgeError;
    use crate::memory::Allocator;

    #[test]
    fn test_default_provider() {
        let cpu = CpuExecutionProvider::default();
        assert_eq!(cpu.provider_type(), &ProviderType::CPU);
        assert!(!cpu.is_async());
        assert!(cpu.create_fence().is_noop());
        assert!(cpu.allocator(MemType::CpuInput).is_none());
        assert_eq!(cpu.allocator(MemType::Default).unwrap().info(), &AllocatorInfo::cpu());
        assert!(!cpu.kernel_registry().is_empty());
    }

    #[test]
    fn test_arena_capacity_enforced() {
        let cpu = CpuExecutionProvider::new(CpuProviderConfig::new().with_arena_capacity(64)).unwrap();
        let allocator = cpu.allocator(MemType::Default).unwrap();
        let _held = allocator.alloc(48).unwrap();
        assert!(matches!(allocator.alloc(32), Err(ForgeError::OutOfMemory(_))));
    }

    #[test]
    fn test_config_from_json() {
        let config: CpuProviderConfig = serde_json::from_str(r#"{"arena_capacity": 1024}"#).unwrap();
        assert_eq!(config.arena_capacity, Some(1024));
        assert_eq!(config.max_pool_size, SlabArena::DEFAULT_MAX_POOL_SIZE);
    }
}
