//! Buffer memory: the slab arena and the allocators built on it
//!
//! Providers own one [`ArenaAllocator`] per memory location. Tensors hold a
//! [`BufferRef`] into the arena; a buffer is physically freed (returned to
//! the size-class pool) only when the last reference to it is dropped.

pub mod allocator;
pub mod arena;

pub use allocator::{Allocator, AllocatorInfo, AllocatorKind, AllocatorPtr, ArenaAllocator, MemType};
pub use arena::{ArenaStats, BufferHandle, BufferRef, SlabArena};
