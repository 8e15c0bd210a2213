//! Async contexts and progress workers.
//!
//! A worker drives every asynchronous state machine of the interfaces bound
//! to it: one call to [`Worker::progress`] executes the one-sided operations
//! queued so far, then delivers pending active messages. `progress` may be
//! called from any thread and from within an active message handler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::iface::IfaceInner;
use crate::registry::registry;
use crate::status::Status;

/// Completion callback for queued one-sided operations.
pub type Completion = Box<dyn FnOnce(Status) + Send + 'static>;

/// Async event delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncMode {
    /// Events are safe to deliver from a separate thread.
    Thread,
    /// Events are only observed through explicit polling.
    Poll,
}

/// Thread-safety mode of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Single-threaded access only.
    Single,
    /// Any thread may post and progress.
    Multi,
}

/// Async execution context.
pub struct AsyncContext {
    _mode: AsyncMode,
}

impl AsyncContext {
    /// Create an async context.
    pub fn new(mode: AsyncMode) -> Result<AsyncContext, Status> {
        Ok(AsyncContext { _mode: mode })
    }
}

pub(crate) struct PendingGet {
    pub(crate) local_addr: u64,
    pub(crate) len: usize,
    pub(crate) lkey: u64,
    pub(crate) remote_addr: u64,
    pub(crate) rkey: u64,
    pub(crate) completion: Completion,
}

pub(crate) struct WorkerInner {
    _thread_mode: ThreadMode,
    gets: Mutex<VecDeque<PendingGet>>,
    ifaces: Mutex<Vec<Weak<IfaceInner>>>,
    progress_count: AtomicU64,
}

impl WorkerInner {
    pub(crate) fn queue_get(&self, get: PendingGet) {
        self.gets.lock().unwrap().push_back(get);
    }
}

/// A progress worker.
#[derive(Clone)]
pub struct Worker(Arc<WorkerInner>);

impl Worker {
    /// Create a worker on the given async context.
    pub fn new(_async: &AsyncContext, thread_mode: ThreadMode) -> Result<Worker, Status> {
        Ok(Worker(Arc::new(WorkerInner {
            _thread_mode: thread_mode,
            gets: Mutex::new(VecDeque::new()),
            ifaces: Mutex::new(Vec::new()),
            progress_count: AtomicU64::new(0),
        })))
    }

    pub(crate) fn downgrade(&self) -> Weak<WorkerInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn attach(&self, iface: &Arc<IfaceInner>) {
        self.0.ifaces.lock().unwrap().push(Arc::downgrade(iface));
    }

    /// One non-blocking progress iteration. Returns the number of events
    /// processed.
    ///
    /// Operations queued by callbacks running inside this call are left for
    /// the next iteration, which bounds the recursion depth of reentrant
    /// progress.
    pub fn progress(&self) -> usize {
        self.0.progress_count.fetch_add(1, Ordering::Relaxed);
        let mut processed = 0;

        let queued = self.0.gets.lock().unwrap().len();
        for _ in 0..queued {
            let get = match self.0.gets.lock().unwrap().pop_front() {
                Some(get) => get,
                None => break,
            };
            let status = registry().copy_remote(
                get.rkey,
                get.remote_addr,
                get.lkey,
                get.local_addr,
                get.len,
            );
            (get.completion)(status);
            processed += 1;
        }

        let ifaces: Vec<Arc<IfaceInner>> = {
            let mut list = self.0.ifaces.lock().unwrap();
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for iface in ifaces {
            processed += iface.deliver_pending();
        }

        processed
    }

    /// Number of progress iterations executed so far.
    pub fn progress_count(&self) -> u64 {
        self.0.progress_count.load(Ordering::Relaxed)
    }
}
