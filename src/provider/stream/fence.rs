//! Fence backed by queue events

use std::sync::{Arc, Mutex};

use crate::error::ForgeResult;
use crate::provider::fence::Fence;
use crate::provider::stream::queue::{DeviceQueue, QueueEvent};
use crate::provider::ProviderType;

/// Fence of a value produced or consumed on a [`DeviceQueue`]
///
/// Work on the owning queue is ordered by the queue itself, so waits from
/// that queue are skipped. Any other consumer blocks on the recorded events.
#[derive(Debug)]
pub struct QueueFence {
    provider: ProviderType,
    queue: Arc<DeviceQueue>,
    read_event: Mutex<Option<QueueEvent>>,
    write_event: Mutex<Option<QueueEvent>>,
}

impl QueueFence {
    pub fn new(provider: ProviderType, queue: Arc<DeviceQueue>) -> Self {
        Self {
            provider,
            queue,
            read_event: Mutex::new(None),
            write_event: Mutex::new(None),
        }
    }

    fn same_queue(&self, provider: &ProviderType, queue_id: usize) -> bool {
        *provider == self.provider && queue_id == self.queue.id()
    }

    fn wait(slot: &Mutex<Option<QueueEvent>>) -> ForgeResult<()> {
        let event = slot.lock()?.clone();
        match event {
            Some(event) => event.synchronize(),
            None => Ok(()),
        }
    }

    fn record(&self, slot: &Mutex<Option<QueueEvent>>, queue_id: usize) -> ForgeResult<()> {
        if queue_id != self.queue.id() {
            return Ok(());
        }
        let event = self.queue.record()?;
        *slot.lock()? = Some(event);
        Ok(())
    }
}

impl Fence for QueueFence {
    fn before_using_as_input(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()> {
        if self.same_queue(provider, queue_id) {
            return Ok(());
        }
        tracing::trace!("{} on queue {} waits for pending writes", provider, queue_id);
        Self::wait(&self.write_event)
    }

    fn before_using_as_output(&self, provider: &ProviderType, queue_id: usize) -> ForgeResult<()> {
        if self.same_queue(provider, queue_id) {
            return Ok(());
        }
        tracing::trace!("{} on queue {} waits for pending reads and writes", provider, queue_id);
        Self::wait(&self.write_event)?;
        Self::wait(&self.read_event)
    }

    fn after_used_as_input(&self, queue_id: usize) -> ForgeResult<()> {
        self.record(&self.read_event, queue_id)
    }

    fn after_used_as_output(&self, queue_id: usize) -> ForgeResult<()> {
        self.record(&self.write_event, queue_id)
    }
}
