//! Allocator trait and the arena-backed allocator used by all providers

use std::fmt;
use std::sync::Arc;

use crate::error::ForgeResult;
use crate::memory::arena::{ArenaStats, BufferRef, SlabArena};

/// How an allocator obtains memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocatorKind {
    /// Direct device allocation
    Device,
    /// Sub-allocation from a pooled arena
    Arena,
}

/// Which side of a device boundary the memory is intended for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MemType {
    /// Provider-native memory
    #[default]
    Default,
    /// Host memory a device kernel reads from (staging input)
    CpuInput,
    /// Host memory a device kernel writes to (staging output)
    CpuOutput,
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemType::Default => "default",
            MemType::CpuInput => "cpu_input",
            MemType::CpuOutput => "cpu_output",
        };
        f.write_str(name)
    }
}

/// Identity of a memory location
///
/// Two values share a location only if all four fields match. The planner
/// never lets a consumer reuse a donor from another location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorInfo {
    pub name: String,
    pub device_id: i32,
    pub kind: AllocatorKind,
    pub mem_type: MemType,
}

impl AllocatorInfo {
    pub fn new(name: impl Into<String>, kind: AllocatorKind, device_id: i32, mem_type: MemType) -> Self {
        Self {
            name: name.into(),
            device_id,
            kind,
            mem_type,
        }
    }

    /// Host arena memory (`"Cpu"`, device 0)
    pub fn cpu() -> Self {
        Self::new("Cpu", AllocatorKind::Arena, 0, MemType::Default)
    }

    /// True if this memory is directly readable by the host
    pub fn is_host_accessible(&self) -> bool {
        self.name == "Cpu" || self.mem_type != MemType::Default
    }
}

impl fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.name, self.device_id, self.mem_type)
    }
}

/// Source of tensor buffers for one location
pub trait Allocator: Send + Sync + fmt::Debug {
    fn info(&self) -> &AllocatorInfo;

    /// Obtain a zeroed buffer of exactly `size` bytes
    fn alloc(&self, size: usize) -> ForgeResult<BufferRef>;

    fn stats(&self) -> ArenaStats;
}

/// Shared allocator handle
pub type AllocatorPtr = Arc<dyn Allocator>;

/// Allocator serving buffers from a [`SlabArena`]
#[derive(Debug)]
pub struct ArenaAllocator {
    info: AllocatorInfo,
    arena: Arc<SlabArena>,
}

impl ArenaAllocator {
    pub fn new(info: AllocatorInfo) -> Self {
        Self::with_arena(info, Arc::new(SlabArena::new()))
    }

    pub fn with_arena(info: AllocatorInfo, arena: Arc<SlabArena>) -> Self {
        Self { info, arena }
    }

    pub fn arena(&self) -> &Arc<SlabArena> {
        &self.arena
    }
}

impl Allocator for ArenaAllocator {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, size: usize) -> ForgeResult<BufferRef> {
        BufferRef::new(&self.arena, size).map_err(|e| {
            tracing::warn!("{}: allocation of {} bytes failed: {}", self.info, size, e);
            e
        })
    }

    fn stats(&self) -> ArenaStats {
        self.arena.stats()
    }
}
