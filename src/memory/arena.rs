//! Slab arena handing out reference-counted buffer handles.
//!
//! Every physical buffer lives in a slot of the slab and is addressed by an
//! opaque [`BufferHandle`] (slot index + generation). Handles are wrapped in
//! [`BufferRef`], which retains on clone and releases on drop. The bytes are
//! returned to a per-size free pool only when the last reference goes away,
//! so an aliasing tensor can never observe a freed buffer and no buffer is
//! freed twice.
//!
//! The slab lock only guards bookkeeping. Each buffer's bytes sit behind
//! their own `RwLock`, taken after the slab lock is released, so readers of
//! different buffers never contend and a byte closure may call back into
//! the arena.
//!
//! # Pooling
//!
//! Freed storage is kept in size-class pools (exact byte size) and handed
//! back on the next request of the same size. `max_pool_size` bounds each
//! pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::enforce;
use crate::error::{ForgeError, ForgeResult};

/// Opaque handle to a buffer inside a [`SlabArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Slot index (stable while the buffer is alive)
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Block {
    bytes: Arc<RwLock<Vec<u8>>>,
    size: usize,
    refs: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    block: Option<Block>,
}

#[derive(Debug, Default)]
struct SlabInner {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    free_pools: HashMap<usize, Vec<Vec<u8>>>,
    live_buffers: usize,
    live_bytes: usize,
    peak_bytes: usize,
    total_allocations: usize,
    total_frees: usize,
    pool_hits: usize,
}

impl SlabInner {
    fn block(&self, handle: BufferHandle) -> &Block {
        let slot = self.slots.get(handle.index as usize);
        match slot {
            Some(slot) if slot.generation == handle.generation && slot.block.is_some() => {
                slot.block.as_ref().unwrap_or_else(|| unreachable!())
            }
            _ => {
                enforce!(false, "stale or foreign buffer handle {}", handle);
                unreachable!()
            }
        }
    }

    fn block_mut(&mut self, handle: BufferHandle) -> &mut Block {
        let valid = matches!(
            self.slots.get(handle.index as usize),
            Some(slot) if slot.generation == handle.generation && slot.block.is_some()
        );
        enforce!(valid, "stale or foreign buffer handle {}", handle);
        match self.slots[handle.index as usize].block.as_mut() {
            Some(block) => block,
            None => unreachable!(),
        }
    }

    fn pooled_bytes(&self) -> usize {
        self.free_pools
            .iter()
            .map(|(size, pool)| size * pool.len())
            .sum()
    }
}

/// Slab arena with size-class pooling and per-buffer reference counts
pub struct SlabArena {
    inner: Mutex<SlabInner>,
    capacity: Option<usize>,
    max_pool_size: usize,
}

impl fmt::Debug for SlabArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabArena")
            .field("capacity", &self.capacity)
            .field("max_pool_size", &self.max_pool_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SlabArena {
    /// Default number of freed buffers kept per size class
    pub const DEFAULT_MAX_POOL_SIZE: usize = 16;

    /// Create an unbounded arena
    pub fn new() -> Self {
        Self::with_limits(None, Self::DEFAULT_MAX_POOL_SIZE)
    }

    /// Create an arena with an optional live-byte capacity
    pub fn with_limits(capacity: Option<usize>, max_pool_size: usize) -> Self {
        Self {
            inner: Mutex::new(SlabInner::default()),
            capacity,
            max_pool_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlabInner> {
        // A panic while holding the lock leaves counters consistent: every
        // mutation below completes before any call that could panic.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserve a zero-initialized buffer of `size` bytes with one reference.
    pub fn reserve(&self, size: usize) -> ForgeResult<BufferHandle> {
        let mut inner = self.lock();

        if let Some(capacity) = self.capacity {
            if inner.live_bytes + size > capacity {
                return Err(ForgeError::OutOfMemory(format!(
                    "arena request of {} bytes exceeds capacity ({} of {} bytes live)",
                    size, inner.live_bytes, capacity
                )));
            }
        }

        let bytes = match inner.free_pools.get_mut(&size).and_then(|pool| pool.pop()) {
            Some(mut recycled) => {
                inner.pool_hits += 1;
                recycled.iter_mut().for_each(|b| *b = 0);
                recycled
            }
            None => vec![0u8; size],
        };

        let index = match inner.vacant.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.block = Some(Block {
            bytes: Arc::new(RwLock::new(bytes)),
            size,
            refs: 1,
        });
        let handle = BufferHandle {
            index,
            generation: slot.generation,
        };

        inner.live_buffers += 1;
        inner.live_bytes += size;
        inner.peak_bytes = inner.peak_bytes.max(inner.live_bytes);
        inner.total_allocations += 1;

        tracing::trace!("SlabArena::reserve: {} ({} bytes)", handle, size);
        Ok(handle)
    }

    /// Add a reference to a live buffer
    pub fn retain(&self, handle: BufferHandle) {
        let mut inner = self.lock();
        inner.block_mut(handle).refs += 1;
    }

    /// Drop a reference. Returns true when this released the last reference
    /// and the storage went back to the pool.
    pub fn release(&self, handle: BufferHandle) -> bool {
        let mut inner = self.lock();
        let block = inner.block_mut(handle);
        block.refs -= 1;
        if block.refs > 0 {
            return false;
        }

        let slot = &mut inner.slots[handle.index as usize];
        let block = match slot.block.take() {
            Some(block) => block,
            None => unreachable!(),
        };
        slot.generation = slot.generation.wrapping_add(1);
        inner.vacant.push(handle.index);

        let size = block.size;
        inner.live_buffers -= 1;
        inner.live_bytes -= size;
        inner.total_frees += 1;

        let max_pool_size = self.max_pool_size;
        let pool = inner.free_pools.entry(size).or_default();
        if pool.len() < max_pool_size {
            // No reference is left, so nobody else holds the storage
            if let Ok(storage) = Arc::try_unwrap(block.bytes) {
                pool.push(storage.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()));
            }
        }

        tracing::trace!("SlabArena::release: {} freed ({} bytes)", handle, size);
        true
    }

    /// Current reference count of a live buffer
    pub fn ref_count(&self, handle: BufferHandle) -> usize {
        self.lock().block(handle).refs
    }

    /// True if the handle still addresses a live buffer
    pub fn is_live(&self, handle: BufferHandle) -> bool {
        let inner = self.lock();
        matches!(
            inner.slots.get(handle.index as usize),
            Some(slot) if slot.generation == handle.generation && slot.block.is_some()
        )
    }

    fn storage(&self, handle: BufferHandle) -> Arc<RwLock<Vec<u8>>> {
        Arc::clone(&self.lock().block(handle).bytes)
    }

    /// Run `f` over the buffer bytes. Only this buffer is locked while `f`
    /// runs; `f` must not write to the same buffer.
    pub fn with_bytes<R>(&self, handle: BufferHandle, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.storage(handle);
        let bytes = storage.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&bytes)
    }

    /// Run `f` over the mutable buffer bytes. `f` must not touch the same
    /// buffer again.
    pub fn with_bytes_mut<R>(&self, handle: BufferHandle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let storage = self.storage(handle);
        let mut bytes = storage.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut bytes)
    }

    /// Snapshot of arena statistics
    pub fn stats(&self) -> ArenaStats {
        let inner = self.lock();
        ArenaStats {
            live_buffers: inner.live_buffers,
            live_bytes: inner.live_bytes,
            peak_bytes: inner.peak_bytes,
            total_allocations: inner.total_allocations,
            total_frees: inner.total_frees,
            pool_hits: inner.pool_hits,
            pooled_bytes: inner.pooled_bytes(),
        }
    }

    /// Drop every pooled (free) buffer. Live buffers are untouched.
    pub fn trim(&self) {
        self.lock().free_pools.clear();
    }
}

impl Default for SlabArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about arena usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Buffers currently referenced
    pub live_buffers: usize,
    /// Bytes currently referenced
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`
    pub peak_bytes: usize,
    /// Number of physical buffers handed out
    pub total_allocations: usize,
    /// Number of physical buffers returned
    pub total_frees: usize,
    /// Requests served from a free pool
    pub pool_hits: usize,
    /// Bytes sitting in free pools
    pub pooled_bytes: usize,
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArenaStats: live={} buffers ({}B), peak={}B, allocations={}, frees={}, pool_hits={}, pooled={}B",
            self.live_buffers,
            self.live_bytes,
            self.peak_bytes,
            self.total_allocations,
            self.total_frees,
            self.pool_hits,
            self.pooled_bytes
        )
    }
}

/// Counted reference to a buffer in a [`SlabArena`]
///
/// Cloning retains, dropping releases. Two `BufferRef`s compare equal when
/// they address the same physical buffer.
pub struct BufferRef {
    arena: Arc<SlabArena>,
    handle: BufferHandle,
    size: usize,
}

impl BufferRef {
    /// Reserve a new buffer in `arena`
    pub fn new(arena: &Arc<SlabArena>, size: usize) -> ForgeResult<Self> {
        let handle = arena.reserve(size)?;
        Ok(Self {
            arena: Arc::clone(arena),
            handle,
            size,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Size in bytes of the physical buffer
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn arena(&self) -> &Arc<SlabArena> {
        &self.arena
    }

    /// True if both refer to the same physical buffer
    pub fn same_buffer(&self, other: &BufferRef) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.handle == other.handle
    }

    /// Number of live references to this buffer
    pub fn ref_count(&self) -> usize {
        self.arena.ref_count(self.handle)
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.arena.with_bytes(self.handle, f)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.arena.with_bytes_mut(self.handle, f)
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.arena.retain(self.handle);
        Self {
            arena: Arc::clone(&self.arena),
            handle: self.handle,
            size: self.size,
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.arena.release(self.handle);
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_buffer(other)
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRef")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let arena = SlabArena::new();
        let handle = arena.reserve(64).unwrap();
        assert_eq!(arena.ref_count(handle), 1);
        assert_eq!(arena.stats().live_bytes, 64);

        assert!(arena.release(handle));
        let stats = arena.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.total_frees, 1);
        assert_eq!(stats.pooled_bytes, 64);
        assert!(!arena.is_live(handle));
    }

    #[test]
    fn test_retain_defers_free() {
        let arena = SlabArena::new();
        let handle = arena.reserve(16).unwrap();
        arena.retain(handle);

        assert!(!arena.release(handle));
        assert!(arena.is_live(handle));
        assert!(arena.release(handle));
        assert!(!arena.is_live(handle));
    }

    #[test]
    fn test_pool_reuses_same_size() {
        let arena = SlabArena::new();
        let a = arena.reserve(32).unwrap();
        arena.with_bytes_mut(a, |b| b.fill(7));
        arena.release(a);

        let b = arena.reserve(32).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.total_allocations, 2);
        // Recycled storage is zeroed
        arena.with_bytes(b, |bytes| assert!(bytes.iter().all(|&x| x == 0)));
        // The stale handle must not alias the new one
        assert_ne!(a, b);
    }

    #[test]
    fn test_pool_size_bounded() {
        let arena = SlabArena::with_limits(None, 1);
        let a = arena.reserve(8).unwrap();
        let b = arena.reserve(8).unwrap();
        arena.release(a);
        arena.release(b);
        assert_eq!(arena.stats().pooled_bytes, 8);
    }

    #[test]
    fn test_capacity_out_of_memory() {
        let arena = SlabArena::with_limits(Some(100), 4);
        let _a = arena.reserve(60).unwrap();
        let err = arena.reserve(60).unwrap_err();
        assert!(matches!(err, ForgeError::OutOfMemory(_)));
    }

    #[test]
    fn test_buffer_ref_clone_and_drop() {
        let arena = Arc::new(SlabArena::new());
        let first = BufferRef::new(&arena, 12).unwrap();
        let second = first.clone();
        assert!(first.same_buffer(&second));
        assert_eq!(first.ref_count(), 2);

        drop(first);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(arena.stats().live_buffers, 1);
        drop(second);
        assert_eq!(arena.stats().live_buffers, 0);
    }

    #[test]
    #[should_panic(expected = "stale or foreign buffer handle")]
    fn test_stale_handle_is_contract_violation() {
        let arena = SlabArena::new();
        let handle = arena.reserve(4).unwrap();
        arena.release(handle);
        arena.retain(handle);
    }

    #[test]
    fn test_byte_closure_may_use_other_buffers() {
        let arena = SlabArena::new();
        let src = arena.reserve(4).unwrap();
        let dst = arena.reserve(4).unwrap();
        arena.with_bytes_mut(src, |b| b.copy_from_slice(&[1, 2, 3, 4]));

        // Copy while the source is held, allocating on the way
        arena.with_bytes(src, |from| {
            let scratch = arena.reserve(8).unwrap();
            arena.with_bytes_mut(dst, |to| to.copy_from_slice(from));
            arena.release(scratch);
        });
        arena.with_bytes(dst, |bytes| assert_eq!(bytes, &[1, 2, 3, 4]));
        assert_eq!(arena.stats().live_buffers, 2);
    }

    #[test]
    fn test_concurrent_writers_on_separate_buffers() {
        let arena = Arc::new(SlabArena::new());
        let handles: Vec<_> = (0..4).map(|_| arena.reserve(256).unwrap()).collect();
        std::thread::scope(|scope| {
            for (i, &handle) in handles.iter().enumerate() {
                let arena = &arena;
                scope.spawn(move || {
                    for _ in 0..100 {
                        arena.with_bytes_mut(handle, |b| b.fill(i as u8));
                        arena.with_bytes(handle, |b| assert!(b.iter().all(|&x| x == i as u8)));
                    }
                });
            }
        });
        for handle in handles {
            assert!(arena.release(handle));
        }
        assert_eq!(arena.stats().pooled_bytes, 4 * 256);
    }

    #[test]
    fn test_stats_display() {
        let arena = SlabArena::new();
        let _h = arena.reserve(1024).unwrap();
        let display = format!("{}", arena.stats());
        assert!(display.contains("live=1 buffers"));
        assert!(display.contains("allocations=1"));
    }
}
