//! In-order work queue backed by one worker thread
//!
//! Jobs run in submission order. An event captures the number of jobs
//! submitted so far; it completes once the worker has finished that many.
//!
//! Jobs report recoverable failures through the run's `AsyncStatus`, so a
//! panicking job is a contract violation. The worker stops, the queue stays
//! faulted, and every later wait or submit panics with the job's message.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{contract_violation, ForgeError, ForgeResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    fault: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    progress: Mutex<Progress>,
    done: Condvar,
}

impl Shared {
    fn wait_for(&self, target: u64) -> ForgeResult<()> {
        let fault = {
            let mut progress = self.progress.lock()?;
            loop {
                if progress.fault.is_some() || progress.completed >= target {
                    break progress.fault.clone();
                }
                progress = self.done.wait(progress)?;
            }
        };
        // Guard released first so the panic does not poison the lock
        match fault {
            Some(message) => fault_panic(&message),
            None => Ok(()),
        }
    }

    fn check_fault(&self) -> ForgeResult<()> {
        let fault = self.progress.lock()?.fault.clone();
        match fault {
            Some(message) => fault_panic(&message),
            None => Ok(()),
        }
    }
}

fn fault_panic(message: &str) -> ! {
    contract_violation(format!("device queue job panicked: {}", message))
}

/// Point in a queue's submission order
#[derive(Debug, Clone)]
pub struct QueueEvent {
    queue_id: usize,
    target: u64,
    shared: Arc<Shared>,
}

impl QueueEvent {
    pub fn queue_id(&self) -> usize {
        self.queue_id
    }

    /// Block until all work submitted before the event has finished
    pub fn synchronize(&self) -> ForgeResult<()> {
        self.shared.wait_for(self.target)
    }

    pub fn is_complete(&self) -> bool {
        self.shared
            .progress
            .lock()
            .map(|p| p.completed >= self.target)
            .unwrap_or(false)
    }
}

/// FIFO queue executing jobs on a dedicated thread
#[derive(Debug)]
pub struct DeviceQueue {
    id: usize,
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceQueue {
    pub fn new(id: usize) -> ForgeResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        let worker = std::thread::Builder::new()
            .name(format!("graphforge-queue-{}", id))
            .spawn(move || {
                for job in receiver {
                    let outcome = catch_unwind(AssertUnwindSafe(job));
                    let mut progress = match worker_shared.progress.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Err(payload) = outcome {
                        let message = payload
                            .downcast_ref::<String>()
                            .cloned()
                            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                            .unwrap_or_else(|| "unknown panic".to_string());
                        tracing::error!("Queue {} job panicked, queue faulted: {}", id, message);
                        progress.fault = Some(message);
                        worker_shared.done.notify_all();
                        break;
                    }
                    progress.completed += 1;
                    worker_shared.done.notify_all();
                }
                tracing::trace!("Queue worker exiting");
            })
            .map_err(|e| ForgeError::Fail(format!("failed to spawn queue worker: {}", e)))?;

        tracing::debug!("Device queue {} started", id);
        Ok(Self {
            id,
            sender: Mutex::new(Some(sender)),
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueue `job` behind everything submitted earlier
    pub fn submit<F>(&self, job: F) -> ForgeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.check_fault()?;
        let sender = self.sender.lock()?;
        let sender = sender
            .as_ref()
            .ok_or_else(|| ForgeError::Fail(format!("device queue {} is shut down", self.id)))?;
        // Count before sending so an event recorded next covers this job
        self.shared.progress.lock()?.submitted += 1;
        sender
            .send(Box::new(job))
            .map_err(|_| ForgeError::Fail(format!("device queue {} worker is gone", self.id)))
    }

    /// Event completing after everything submitted so far
    pub fn record(&self) -> ForgeResult<QueueEvent> {
        let target = self.shared.progress.lock()?.submitted;
        tracing::trace!("Queue {}: event at {}", self.id, target);
        Ok(QueueEvent {
            queue_id: self.id,
            target,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Block until the queue is drained
    pub fn synchronize(&self) -> ForgeResult<()> {
        self.record()?.synchronize()
    }

    /// Jobs submitted and not yet finished
    pub fn pending(&self) -> u64 {
        self.shared
            .progress
            .lock()
            .map(|p| p.submitted - p.completed)
            .unwrap_or(0)
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    tracing::warn!("Queue {} worker terminated abnormally", self.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order() {
        let queue = DeviceQueue::new(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    log.lock().unwrap().push(i);
                })
                .unwrap();
        }
        queue.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_event_waits_only_for_earlier_work() {
        let queue = DeviceQueue::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        queue.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let event = queue.record().unwrap();
        event.synchronize().unwrap();
        assert!(event.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
        payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn test_panicking_job_faults_every_waiter() {
        let queue = Arc::new(DeviceQueue::new(2).unwrap());
        // An event from before the faulty job is covered too
        let earlier = queue.record().unwrap();
        queue.submit(|| panic!("kernel exploded")).unwrap();

        // Two independent waiters, as two concurrent runs would be
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.synchronize())
            })
            .collect();
        for waiter in waiters {
            let payload = waiter.join().unwrap_err();
            let message = panic_message(payload);
            assert!(message.contains("contract violation"), "{}", message);
            assert!(message.contains("kernel exploded"), "{}", message);
        }

        let err = catch_unwind(AssertUnwindSafe(|| earlier.synchronize())).unwrap_err();
        assert!(panic_message(err).contains("kernel exploded"));
        let err = catch_unwind(AssertUnwindSafe(|| queue.submit(|| {}))).unwrap_err();
        assert!(panic_message(err).contains("kernel exploded"));
    }

    #[test]
    fn test_failing_job_result_stays_with_its_run() {
        use crate::executor::AsyncStatus;

        let queue = DeviceQueue::new(3).unwrap();
        let failed_run = AsyncStatus::new();
        let clean_run = AsyncStatus::new();
        let status = failed_run.clone();
        queue
            .submit(move || status.record(ForgeError::Fail("bad input".to_string())))
            .unwrap();
        queue.submit(|| {}).unwrap();

        queue.synchronize().unwrap();
        assert!(failed_run.check().is_err());
        assert!(clean_run.check().is_ok());
    }
}
