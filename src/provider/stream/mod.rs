//! Simulated asynchronous device
//!
//! The stream provider behaves like a GPU execution provider without a GPU:
//! its default memory is a separate arena the host must not read directly,
//! its kernels return as soon as their work is queued, and a single worker
//! thread executes the queue in order. Values crossing between the host and
//! the stream are guarded by [`QueueFence`]s.

pub mod fence;
pub mod kernels;
pub mod queue;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::kernel::KernelRegistry;
use crate::memory::{AllocatorInfo, AllocatorKind, AllocatorPtr, ArenaAllocator, MemType, SlabArena};
use crate::provider::{ExecutionProvider, FencePtr, ProviderType, HOST_QUEUE_ID};

pub use fence::QueueFence;
pub use queue::{DeviceQueue, QueueEvent};

/// Allocator name of stream memory
pub const STREAM_ALLOCATOR_NAME: &str = "Stream";

/// Configuration for the stream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamProviderConfig {
    pub device_id: i32,
    /// Queue id; must differ from the host queue (0)
    pub queue_id: usize,
    /// Upper bound on live device bytes; `None` means unbounded
    pub arena_capacity: Option<usize>,
    pub max_pool_size: usize,
}

impl Default for StreamProviderConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            queue_id: 1,
            arena_capacity: None,
            max_pool_size: SlabArena::DEFAULT_MAX_POOL_SIZE,
        }
    }
}

impl StreamProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = Some(bytes);
        self
    }

    pub fn with_queue_id(mut self, queue_id: usize) -> Self {
        self.queue_id = queue_id;
        self
    }
}

/// Asynchronous provider executing on a [`DeviceQueue`]
#[derive(Debug)]
pub struct StreamExecutionProvider {
    provider_type: ProviderType,
    config: StreamProviderConfig,
    queue: Arc<DeviceQueue>,
    device: Arc<ArenaAllocator>,
    staging_input: Arc<ArenaAllocator>,
    staging_output: Arc<ArenaAllocator>,
    registry: Arc<KernelRegistry>,
}

impl StreamExecutionProvider {
    pub fn new(config: StreamProviderConfig) -> ForgeResult<Self> {
        if config.queue_id == HOST_QUEUE_ID {
            return Err(ForgeError::InvalidArgument(format!(
                "stream queue id must not be the host queue id {}",
                HOST_QUEUE_ID
            )));
        }

        let provider_type = ProviderType::STREAM;
        let queue = Arc::new(DeviceQueue::new(config.queue_id)?);

        let device_arena = Arc::new(SlabArena::with_limits(config.arena_capacity, config.max_pool_size));
        let device = Arc::new(ArenaAllocator::with_arena(
            AllocatorInfo::new(STREAM_ALLOCATOR_NAME, AllocatorKind::Device, config.device_id, MemType::Default),
            device_arena,
        ));
        // Staging memory is host memory registered under the device's name
        let staging = |mem_type| {
            Arc::new(ArenaAllocator::with_arena(
                AllocatorInfo::new(STREAM_ALLOCATOR_NAME, AllocatorKind::Arena, config.device_id, mem_type),
                Arc::new(SlabArena::with_limits(None, config.max_pool_size)),
            ))
        };
        let staging_input = staging(MemType::CpuInput);
        let staging_output = staging(MemType::CpuOutput);

        let mut registry = KernelRegistry::new();
        kernels::register_kernels(&mut registry, &provider_type, &queue)?;

        tracing::info!(
            "Stream provider ready: device {}, queue {}, {} kernels",
            config.device_id,
            config.queue_id,
            registry.len()
        );
        Ok(Self {
            provider_type,
            config,
            queue,
            device,
            staging_input,
            staging_output,
            registry: Arc::new(registry),
        })
    }

    pub fn config(&self) -> &StreamProviderConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DeviceQueue> {
        &self.queue
    }

    /// Device arena
    pub fn device_arena(&self) -> &Arc<SlabArena> {
        self.device.arena()
    }
}

impl ExecutionProvider for StreamExecutionProvider {
    fn provider_type(&self) -> &ProviderType {
        &self.provider_type
    }

    fn allocator(&self, mem_type: MemType) -> Option<AllocatorPtr> {
        let allocator: AllocatorPtr = match mem_type {
            MemType::Default => self.device.clone(),
            MemType::CpuInput => self.staging_input.clone(),
            MemType::CpuOutput => self.staging_output.clone(),
        };
        Some(allocator)
    }

    fn allocators(&self) -> Vec<AllocatorPtr> {
        vec![
            self.device.clone() as AllocatorPtr,
            self.staging_input.clone() as AllocatorPtr,
            self.staging_output.clone() as AllocatorPtr,
        ]
    }

    fn kernel_registry(&self) -> Arc<KernelRegistry> {
        Arc::clone(&self.registry)
    }

    fn queue_id(&self) -> usize {
        self.queue.id()
    }

    fn is_async(&self) -> bool {
        true
    }

    fn is_device(&self) -> bool {
        true
    }

    fn create_fence(&self) -> FencePtr {
        Arc::new(QueueFence::new(self.provider_type.clone(), Arc::clone(&self.queue)))
    }

    fn synchronize(&self) -> ForgeResult<()> {
        self.queue.synchronize()
    }
}
