//! Render-thread work queue.
//!
//! Only the render thread may drive the backend. Other threads submit jobs
//! through a [`WorkQueue`] handle; the render thread runs them in FIFO order
//! when it calls [`GraphicsDevice::dispatch_queue`].
//!
//! ```text
//! producer threads               render thread
//!   WorkQueue::enqueue ──push──▶ [ FIFO ] ──take all──▶ job(&mut device)
//!   WorkQueue::lockup  ──push──▶           ...
//!        ◀──────────── reply over channel ───────────────┘
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::device::GraphicsDevice;
use crate::error::GraphicsError;

/// A unit of work executed once on the render thread.
pub type Job = Box<dyn FnOnce(&mut GraphicsDevice) + Send + 'static>;

pub(crate) type JobList = RefCell<VecDeque<Job>>;

struct Shared {
    jobs: ReentrantMutex<JobList>,
    render_thread: Mutex<ThreadId>,
    closed: AtomicBool,
}

/// Cloneable handle for submitting work to a device's render thread.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("render_thread", &*self.shared.render_thread.lock())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(WorkQueue: Send, Sync);

impl WorkQueue {
    /// Create a queue whose render thread is the calling thread.
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: ReentrantMutex::new(RefCell::new(VecDeque::new())),
                render_thread: Mutex::new(thread::current().id()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append a job. It runs at the render thread's next `dispatch_queue`.
    ///
    /// Jobs submitted after the device is dropped are discarded.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&mut GraphicsDevice) + Send + 'static,
    {
        if self.push(Box::new(job)).is_err() {
            log::warn!("Work queue closed, dropping job");
        }
    }

    /// Run `f` on the render thread and wait for its result.
    ///
    /// Blocks until the render thread's next `dispatch_queue`. Calling this
    /// from the render thread would deadlock and is rejected.
    pub fn lockup<F, R>(&self, f: F) -> Result<R, GraphicsError>
    where
        F: FnOnce(&mut GraphicsDevice) -> R + Send + 'static,
        R: Send + 'static,
    {
        debug_assert!(
            !self.is_render_thread(),
            "WorkQueue::lockup called from the render thread"
        );
        if self.is_render_thread() {
            return Err(GraphicsError::InvalidParameter(
                "WorkQueue::lockup called from the render thread".into(),
            ));
        }

        let (reply, result) = crossbeam_channel::bounded(1);
        self.push(Box::new(move |device: &mut GraphicsDevice| {
            let _ = reply.send(f(device));
        }))?;
        result.recv().map_err(|_| GraphicsError::QueueClosed)
    }

    /// Number of jobs waiting.
    pub fn pending(&self) -> usize {
        self.shared.jobs.lock().borrow().len()
    }

    pub fn is_render_thread(&self) -> bool {
        *self.shared.render_thread.lock() == thread::current().id()
    }

    pub fn render_thread(&self) -> ThreadId {
        *self.shared.render_thread.lock()
    }

    /// True once the owning device is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, job: Job) -> Result<(), GraphicsError> {
        let guard = self.shared.jobs.lock();
        if self.is_closed() {
            return Err(GraphicsError::QueueClosed);
        }
        guard.borrow_mut().push_back(job);
        Ok(())
    }

    /// Make the calling thread the render thread.
    pub(crate) fn stamp_render_thread(&self) {
        *self.shared.render_thread.lock() = thread::current().id();
    }

    /// Acquire the submission lock. Re-entrant on the holding thread.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, JobList> {
        self.shared.jobs.lock()
    }

    /// Refuse new jobs and discard pending ones.
    pub(crate) fn close(&self) {
        let guard = self.shared.jobs.lock();
        self.shared.closed.store(true, Ordering::Release);
        let discarded = std::mem::take(&mut *guard.borrow_mut());
        if !discarded.is_empty() {
            log::warn!("Discarding {} pending jobs", discarded.len());
        }
        drop(discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_counts_pending() {
        let queue = WorkQueue::new();
        queue.enqueue(|_| {});
        queue.clone().enqueue(|_| {});
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn test_closed_queue_drops_jobs() {
        let queue = WorkQueue::new();
        queue.enqueue(|_| {});
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.pending(), 0);

        queue.enqueue(|_| {});
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_lockup_on_closed_queue() {
        let queue = WorkQueue::new();
        queue.close();
        let producer = queue.clone();
        let result = std::thread::spawn(move || producer.lockup(|_| 1))
            .join()
            .unwrap();
        assert!(matches!(result, Err(GraphicsError::QueueClosed)));
    }

    #[test]
    fn test_close_releases_blocked_lockup() {
        let queue = WorkQueue::new();
        let producer = queue.clone();
        let waiter = std::thread::spawn(move || producer.lockup(|_| 1));

        while queue.pending() == 0 {
            std::thread::yield_now();
        }
        queue.close();

        assert!(matches!(waiter.join().unwrap(), Err(GraphicsError::QueueClosed)));
    }

    #[test]
    fn test_render_thread_stamp() {
        let queue = WorkQueue::new();
        assert!(queue.is_render_thread());

        let other = queue.clone();
        let moved = std::thread::spawn(move || {
            other.stamp_render_thread();
            other.is_render_thread()
        })
        .join()
        .unwrap();
        assert!(moved);
        assert!(!queue.is_render_thread());
    }

    #[test]
    fn test_lock_is_reentrant() {
        let queue = WorkQueue::new();
        let _outer = queue.lock();
        queue.enqueue(|_| {});
        assert_eq!(queue.pending(), 1);
    }
}
