//! Single serial background worker.
//!
//! Narrowed from a dedicated-thread-plus-atomic-cancellation-flag preload
//! pattern down to a strict one-task-at-a-time invariant: exactly one
//! dedicated worker thread, fed by a channel, posting results back
//! through a second channel that the coordinator drains on its event loop
//! tick. There is no rayon pool here — parallelism across tasks would
//! violate the serial invariant.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::EngineResult;
use crate::types::Image;

type Work = Box<dyn FnOnce() -> EngineResult<Image> + Send>;

struct Job<M> {
    meta: M,
    generation: u64,
    filter_unique_id: u64,
    work: Work,
}

/// One finished unit of work, tagged with whatever metadata the caller
/// submitted it with (typically a [`crate::scheduler::Task`]) plus the
/// scheduler generation observed at submission time, so the coordinator
/// can tell a stale result from a live one.
pub struct TaskResult<M> {
    pub meta: M,
    pub generation: u64,
    pub result: EngineResult<Image>,
}

/// Runtime error returned by `submit` when a task is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Drives exactly one background thread. Generic over `M`, the metadata a
/// caller attaches to each submitted job (kept opaque to the worker
/// itself, which only ever runs the supplied closure).
pub struct ThreadManager<M: Send + 'static> {
    sender: mpsc::Sender<Job<M>>,
    receiver: Mutex<mpsc::Receiver<TaskResult<M>>>,
    busy: Arc<AtomicBool>,
    in_flight_filters: Arc<Mutex<HashSet<u64>>>,
    _handle: JoinHandle<()>,
}

impl<M: Send + 'static> ThreadManager<M> {
    pub fn new() -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job<M>>();
        let (result_tx, result_rx) = mpsc::channel::<TaskResult<M>>();
        let busy = Arc::new(AtomicBool::new(false));
        let in_flight_filters = Arc::new(Mutex::new(HashSet::new()));

        let worker_busy = Arc::clone(&busy);
        let worker_filters = Arc::clone(&in_flight_filters);
        let handle = std::thread::Builder::new()
            .name("quill-engine-worker".into())
            .spawn(move || {
                for job in job_rx {
                    let result = (job.work)();
                    worker_filters.lock().remove(&job.filter_unique_id);
                    worker_busy.store(false, Ordering::Release);
                    if result_tx.send(TaskResult { meta: job.meta, generation: job.generation, result }).is_err() {
                        tracing::debug!("coordinator dropped, worker exiting");
                        return;
                    }
                }
            })
            .expect("failed to spawn background worker thread");

        Self {
            sender: job_tx,
            receiver: Mutex::new(result_rx),
            busy,
            in_flight_filters,
            _handle: handle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Submit a unit of work. Fails with [`Busy`] if a task is already
    /// running, since the worker is strictly serial.
    pub fn submit(&self, meta: M, generation: u64, filter_unique_id: u64, work: Work) -> Result<(), Busy> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Busy);
        }
        self.in_flight_filters.lock().insert(filter_unique_id);
        let job = Job { meta, generation, filter_unique_id, work };
        if self.sender.send(job).is_err() {
            self.busy.store(false, Ordering::Release);
            self.in_flight_filters.lock().remove(&filter_unique_id);
            return Err(Busy);
        }
        Ok(())
    }

    /// Non-blocking: returns the next finished result, if any.
    pub fn poll_result(&self) -> Option<TaskResult<M>> {
        self.receiver.lock().try_recv().ok()
    }

    /// Block until a result is posted or `timeout_ms` elapses.
    pub fn wait_for_result(&self, timeout_ms: u64) -> Option<TaskResult<M>> {
        self.receiver.lock().recv_timeout(std::time::Duration::from_millis(timeout_ms)).ok()
    }

    /// Whether `filter_unique_id` may be safely dropped: false while a
    /// task still holds it. Filters held by an in-flight task must not be
    /// deleted until the worker reports done.
    pub fn allow_delete(&self, filter_unique_id: u64) -> bool {
        !self.in_flight_filters.lock().contains(&filter_unique_id)
    }
}

impl<M: Send + 'static> Default for ThreadManager<M> {
    fn default() -> Self {
        Self::new()
    }
}
