//! Execution providers
//!
//! A provider is a compute backend: it owns allocators for its memory
//! locations, a built-in kernel registry, and (for asynchronous devices) a
//! queue plus the fences ordering work on it.
//!
//! Two providers ship with the crate:
//! - [`cpu::CpuExecutionProvider`]: synchronous, host memory
//! - [`stream::StreamExecutionProvider`]: a simulated asynchronous device that
//!   executes kernels in FIFO order on a worker thread

pub mod cpu;
pub mod fence;
pub mod stream;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::kernel::KernelRegistry;
use crate::memory::{AllocatorInfo, AllocatorPtr, MemType};

pub use fence::{no_fence, Fence, FencePtr, NoFence};

/// Queue id used by synchronous (host) providers
pub const HOST_QUEUE_ID: usize = 0;

/// Provider identity, e.g. `"CPUExecutionProvider"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderType(Cow<'static, str>);

impl ProviderType {
    pub const CPU: ProviderType = ProviderType(Cow::Borrowed("CPUExecutionProvider"));
    pub const STREAM: ProviderType = ProviderType(Cow::Borrowed("StreamExecutionProvider"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(name: &str) -> Self {
        match name {
            "CPUExecutionProvider" => ProviderType::CPU,
            "StreamExecutionProvider" => ProviderType::STREAM,
            other => ProviderType::new(other),
        }
    }
}

/// A compute backend
pub trait ExecutionProvider: Send + Sync + fmt::Debug {
    fn provider_type(&self) -> &ProviderType;

    /// Allocator for one memory type, if the provider has it
    fn allocator(&self, mem_type: MemType) -> Option<AllocatorPtr>;

    fn allocators(&self) -> Vec<AllocatorPtr>;

    /// Built-in kernels
    fn kernel_registry(&self) -> Arc<KernelRegistry>;

    /// Queue kernels of this provider are submitted on
    fn queue_id(&self) -> usize {
        HOST_QUEUE_ID
    }

    /// True if kernels return before their work has completed
    fn is_async(&self) -> bool {
        false
    }

    /// True if default memory is not directly host readable
    fn is_device(&self) -> bool {
        false
    }

    /// Fence for a value shared with other providers
    fn create_fence(&self) -> FencePtr {
        no_fence()
    }

    /// Wait for all submitted work
    fn synchronize(&self) -> ForgeResult<()> {
        Ok(())
    }
}

pub type ProviderPtr = Arc<dyn ExecutionProvider>;

/// Registered providers and every allocator they expose
#[derive(Debug, Default, Clone)]
pub struct ProviderTable {
    providers: Vec<ProviderPtr>,
    allocators: HashMap<AllocatorInfo, AllocatorPtr>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; a second provider of the same type is rejected
    pub fn add(&mut self, provider: ProviderPtr) -> ForgeResult<()> {
        let provider_type = provider.provider_type().clone();
        if self.get(&provider_type).is_some() {
            return Err(ForgeError::Fail(format!(
                "execution provider {} is already registered",
                provider_type
            )));
        }
        for allocator in provider.allocators() {
            let info = allocator.info().clone();
            if self.allocators.contains_key(&info) {
                return Err(ForgeError::Fail(format!(
                    "allocator {} of {} clashes with an existing allocator",
                    info, provider_type
                )));
            }
            self.allocators.insert(info, allocator);
        }
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, provider_type: &ProviderType) -> Option<&ProviderPtr> {
        self.providers
            .iter()
            .find(|p| p.provider_type() == provider_type)
    }

    /// Provider or `NotFound`
    pub fn require(&self, provider_type: &ProviderType) -> ForgeResult<&ProviderPtr> {
        self.get(provider_type).ok_or_else(|| {
            ForgeError::NotFound(format!("execution provider {} is not registered", provider_type))
        })
    }

    pub fn contains(&self, provider_type: &ProviderType) -> bool {
        self.get(provider_type).is_some()
    }

    /// Providers in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ProviderPtr> {
        self.providers.iter()
    }

    pub fn types(&self) -> Vec<ProviderType> {
        self.providers
            .iter()
            .map(|p| p.provider_type().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn allocator_for(&self, info: &AllocatorInfo) -> Option<&AllocatorPtr> {
        self.allocators.get(info)
    }

    /// Location of `provider`'s memory of `mem_type`
    pub fn location(&self, provider_type: &ProviderType, mem_type: MemType) -> ForgeResult<AllocatorInfo> {
        let provider = self.require(provider_type)?;
        provider
            .allocator(mem_type)
            .or_else(|| provider.allocator(MemType::Default))
            .map(|a| a.info().clone())
            .ok_or_else(|| {
                ForgeError::NotFound(format!(
                    "{} has no allocator for {} memory",
                    provider_type, mem_type
                ))
            })
    }

    /// Synchronize every asynchronous provider
    pub fn synchronize_all(&self) -> ForgeResult<()> {
        for provider in self.providers.iter().filter(|p| p.is_async()) {
            provider.synchronize()?;
        }
        Ok(())
    }
}
