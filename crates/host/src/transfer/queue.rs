//! Per-pipe transfer queue
//!
//! Each queue owns a FIFO of pending requests and at most one worker thread.
//! The worker is spawned lazily by [`TransferQueue::enqueue`] and exits on
//! its own once the FIFO is drained. Popping the last request, clearing the
//! worker handle and appending + spawning all happen under the same lock,
//! so a request can never be left behind by an exiting worker.
//!
//! Aborts are tracked by generation. Every request records the queue's abort
//! generation when it is appended; [`TransferQueue::abort`] bumps the
//! generation, so it applies exactly to the requests queued before the call.
//! The worker completes those as `Aborted` in FIFO order instead of running
//! them.

use super::irp::Irp;
use crate::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace, warn};
use usb_types::{Result, UsbError};

/// Performs one request; errors are recorded on the request by the queue
pub type Executor = dyn Fn(&Irp, &AbortSignal) -> Result<()> + Send + Sync;

/// Invoked after every request completes, in completion order
pub type FinishCallback = dyn Fn(&Arc<Irp>) + Send + Sync;

/// Abort view of one request, handed to the executor
///
/// Reports aborting once the queue has been aborted after the request was
/// queued. A standalone signal from [`AbortSignal::new`] never aborts.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    generation: Arc<AtomicU64>,
    queued_at: u64,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborting(&self) -> bool {
        self.generation.load(Ordering::Acquire) > self.queued_at
    }

    fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new abort generation, returning it
    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn for_request(&self, queued_at: u64) -> Self {
        Self {
            generation: self.generation.clone(),
            queued_at,
        }
    }
}

struct Pending {
    irp: Arc<Irp>,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    worker: Option<JoinHandle<()>>,
    worker_thread: Option<ThreadId>,
    /// Abort generation of the request being executed
    in_flight: Option<u64>,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    idle: Condvar,
    abort: AbortSignal,
    executor: Box<Executor>,
    on_finish: Box<FinishCallback>,
}

/// FIFO of requests drained by a lazily spawned worker thread
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl TransferQueue {
    pub fn new<E, F>(name: impl Into<String>, executor: E, on_finish: F) -> Self
    where
        E: Fn(&Irp, &AbortSignal) -> Result<()> + Send + Sync + 'static,
        F: Fn(&Arc<Irp>) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                abort: AbortSignal::new(),
                executor: Box::new(executor),
                on_finish: Box::new(on_finish),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Append a request, spawning the worker if none is running
    ///
    /// A completed request may be submitted again; its state is reset to
    /// pending. A request that is still queued or in flight is rejected.
    pub fn enqueue(&self, irp: Arc<Irp>) -> Result<()> {
        irp.begin()?;

        let mut state = lock(&self.shared.state);
        let generation = self.shared.abort.current();
        state.pending.push_back(Pending {
            irp: irp.clone(),
            generation,
        });

        if state.worker.is_none() {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("usb-queue-{}", self.shared.name))
                .spawn(move || run_worker(shared));

            match spawned {
                Ok(handle) => {
                    state.worker_thread = Some(handle.thread().id());
                    state.worker = Some(handle);
                    trace!("Spawned worker for queue {}", self.shared.name);
                }
                Err(e) => {
                    state.pending.pop_back();
                    warn!(
                        "Failed to spawn worker for queue {}: {}",
                        self.shared.name, e
                    );
                    let err = UsbError::platform(
                        usb_types::error::code::NO_MEM,
                        format!("failed to spawn queue worker: {}", e),
                    );
                    irp.complete(Err(err.clone()));
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Discard every request not yet started and wait for them and the
    /// request in flight to complete
    ///
    /// Discarded requests complete as [`UsbError::Aborted`], after the
    /// request in flight and in submission order. A request already handed
    /// to the native driver is not interrupted; an IN request that is only
    /// waiting out timeouts stops retrying and fails with `Aborted`.
    /// Requests queued after this call starts are not affected.
    pub fn abort(&self) {
        let mut state = lock(&self.shared.state);
        let target = self.shared.abort.bump();

        let discarded = state
            .pending
            .iter()
            .filter(|pending| pending.generation < target)
            .count();
        if discarded > 0 {
            debug!(
                "Aborting {} pending requests on queue {}",
                discarded, self.shared.name
            );
        }

        // Called from a completion callback: the worker cannot wait for itself
        if state.worker_thread == Some(thread::current().id()) {
            return;
        }

        // Older generations sit at the front of the FIFO
        while state
            .pending
            .front()
            .is_some_and(|pending| pending.generation < target)
            || state.in_flight.is_some_and(|generation| generation < target)
        {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// True while requests are pending or the worker is alive
    pub fn is_busy(&self) -> bool {
        let state = lock(&self.shared.state);
        !state.pending.is_empty() || state.worker.is_some()
    }

    /// Number of requests waiting behind the one in flight
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let (irp, signal) = {
            let mut state = lock(&shared.state);
            if state.in_flight.take().is_some() {
                shared.idle.notify_all();
            }
            match state.pending.pop_front() {
                Some(pending) => {
                    state.in_flight = Some(pending.generation);
                    (pending.irp, shared.abort.for_request(pending.generation))
                }
                None => {
                    // Dropping the handle detaches this thread, which is about to return
                    state.worker = None;
                    state.worker_thread = None;
                    shared.idle.notify_all();
                    trace!("Worker for queue {} exiting", shared.name);
                    return;
                }
            }
        };

        let result = if signal.is_aborting() {
            trace!("Discarding aborted request on queue {}", shared.name);
            Err(UsbError::Aborted)
        } else {
            (shared.executor)(&irp, &signal)
        };
        if let Err(e) = &result {
            debug!("Request on queue {} failed: {}", shared.name, e);
        }
        irp.complete(result);
        (shared.on_finish)(&irp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_idle_queue_is_not_busy() {
        let queue = TransferQueue::new("idle", |_: &Irp, _: &AbortSignal| Ok(()), |_: &Arc<Irp>| {});
        assert!(!queue.is_busy());
        assert_eq!(queue.pending(), 0);
        queue.abort();
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_worker_exits_after_draining() {
        let queue = TransferQueue::new("drain", |_: &Irp, _: &AbortSignal| Ok(()), |_: &Arc<Irp>| {});
        let irp = Arc::new(Irp::new(vec![0; 8]));
        queue.enqueue(irp.clone()).unwrap();

        assert!(irp.wait_timeout(Duration::from_secs(5)));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while queue.is_busy() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_executor_error_is_recorded() {
        let queue = TransferQueue::new(
            "error",
            |_: &Irp, _: &AbortSignal| Err(UsbError::timeout()),
            |_: &Arc<Irp>| {},
        );
        let irp = Arc::new(Irp::new(vec![0; 8]));
        queue.enqueue(irp.clone()).unwrap();

        irp.wait();
        assert_eq!(irp.error(), Some(UsbError::timeout()));
    }

    #[test]
    fn test_signal_follows_abort_generation() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborting());

        let queued = signal.for_request(signal.current());
        assert!(!queued.is_aborting());
        signal.bump();
        assert!(queued.is_aborting());
        assert!(!signal.for_request(signal.current()).is_aborting());
    }

    #[test]
    fn test_requeue_while_pending_is_rejected() {
        let queue = TransferQueue::new(
            "requeue",
            |_: &Irp, _: &AbortSignal| {
                thread::sleep(Duration::from_millis(20));
                Ok(())
            },
            |_: &Arc<Irp>| {},
        );
        let irp = Arc::new(Irp::new(vec![0; 8]));
        queue.enqueue(irp.clone()).unwrap();

        let err = queue.enqueue(irp.clone()).unwrap_err();
        assert!(matches!(err, UsbError::InvalidRequest(_)));

        irp.wait();
        assert_eq!(irp.result(), Some(Ok(())));
    }
}
