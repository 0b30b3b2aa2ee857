//! Deferred release of native handles.
//!
//! Resource objects are shared through `Arc` and may be dropped on any thread,
//! but only the render thread may touch the backend. Dropping the last
//! reference therefore never destroys the native object directly:
//!
//! ```text
//! On Drop(Resource):
//!   1. Push the NativeHandle onto the device's ReleaseQueue
//!
//! On frame boundary (present, dispatch_queue, flush_state, collect_garbage):
//!   1. Drain the queue
//!   2. GpuBackend::release() every handle
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::NativeHandle;

/// Shared list of handles waiting to be released by the device.
#[derive(Debug, Clone, Default)]
pub struct ReleaseQueue {
    pending: Arc<Mutex<Vec<NativeHandle>>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `handle` for release at the next frame boundary.
    pub fn defer(&self, handle: NativeHandle) {
        self.pending.lock().push(handle);
    }

    /// Take every pending handle, oldest first.
    pub fn drain(&self) -> Vec<NativeHandle> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defer_and_drain() {
        let queue = ReleaseQueue::new();
        let clone = queue.clone();

        clone.defer(NativeHandle(3));
        clone.defer(NativeHandle(1));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain(), vec![NativeHandle(3), NativeHandle(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_defer_from_other_thread() {
        let queue = ReleaseQueue::new();
        let producer = queue.clone();
        std::thread::spawn(move || producer.defer(NativeHandle(7)))
            .join()
            .unwrap();
        assert_eq!(queue.drain(), vec![NativeHandle(7)]);
    }
}
