//! Cross-device fence protocol
//!
//! A fence is attached to a value whose producer and consumers may run on
//! different providers. Before a kernel touches the value it waits on the
//! fence; afterwards it signals on its own queue:
//!
//! ```text
//! before_using_as_input(provider, queue)   wait for the last write
//! before_using_as_output(provider, queue)  wait for the last write and all reads
//! after_used_as_input(queue)               record a read on `queue`
//! after_used_as_output(queue)              record a write on `queue`
//! ```
//!
//! Values that never cross a provider boundary carry the shared [`NoFence`].

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::error::ForgeResult;
use crate::provider::ProviderType;

/// Synchronization handle attached to a value
pub trait Fence: Send + Sync + fmt::Debug {
    /// Block (or enqueue a wait) until pending writes are visible to
    /// `provider` on `queue_id`.
    fn before_using_as_input(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()>;

    /// Block (or enqueue a wait) until pending reads and writes finished so
    /// the value can be overwritten.
    fn before_using_as_output(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()>;

    /// Mark that work reading the value was submitted on `queue_id`
    fn after_used_as_input(&self, queue_id: usize) -> ForgeResult<()>;

    /// Mark that work writing the value was submitted on `queue_id`
    fn after_used_as_output(&self, queue_id: usize) -> ForgeResult<()>;

    /// True for the no-op fence
    fn is_noop(&self) -> bool {
        false
    }
}

/// Shared fence handle
pub type FencePtr = Arc<dyn Fence>;

/// Fence that never waits
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFence;

impl Fence for NoFence {
    fn before_using_as_input(&self, _provider: &ProviderType, _queue_id: usize) -> ForgeResult<()> {
        Ok(())
    }

    fn before_using_as_output(&self, _provider: &ProviderType, _queue_id: usize) -> ForgeResult<()> {
        Ok(())
    }

    fn after_used_as_input(&self, _queue_id: usize) -> ForgeResult<()> {
        Ok(())
    }

    fn after_used_as_output(&self, _queue_id: usize) -> ForgeResult<()> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

static NO_FENCE: Lazy<FencePtr> = Lazy::new(|| Arc::new(NoFence));

/// The process-wide no-op fence
pub fn no_fence() -> FencePtr {
    Arc::clone(&NO_FENCE)
}
