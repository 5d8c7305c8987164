// src/session/send_queue.rs

//! The bounded, multi-producer batch queue feeding a session's send pump.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// A bounded queue of outbound byte segments.
///
/// Any thread may enqueue; only the session's send pump drains. Ordering
/// between producers is arrival order, and a multi-segment enqueue is
/// contiguous. Enqueues that would overflow the capacity fail instead of
/// blocking.
pub struct SendQueue {
    segments: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    ready: Notify,
}

impl SendQueue {
    /// The capacity is clamped up to the configured minimum.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(crate::config::MIN_SENDING_QUEUE_SIZE);
        Self {
            segments: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }

    /// Appends one segment. Returns `false` without enqueuing anything if the
    /// queue is full.
    pub fn enqueue(&self, segment: Bytes) -> bool {
        {
            let mut q = self.segments.lock();
            if q.len() >= self.capacity {
                return false;
            }
            q.push_back(segment);
        }
        self.ready.notify_one();
        true
    }

    /// Appends a list of segments atomically: either all fit or none are
    /// enqueued. The segments stay contiguous in the drain order.
    pub fn enqueue_all(&self, segments: Vec<Bytes>) -> bool {
        if segments.is_empty() {
            return true;
        }
        {
            let mut q = self.segments.lock();
            if q.len() + segments.len() > self.capacity {
                return false;
            }
            q.extend(segments);
        }
        self.ready.notify_one();
        true
    }

    /// Drains up to `capacity` segments into `out` in FIFO order. Returns
    /// `true` if anything was moved.
    pub fn try_dequeue(&self, out: &mut Vec<Bytes>) -> bool {
        let mut q = self.segments.lock();
        if q.is_empty() {
            return false;
        }
        let n = q.len().min(self.capacity);
        out.extend(q.drain(..n));
        true
    }

    /// Waits until a producer signals new segments. A signal that arrived
    /// before the wait is not lost.
    pub(crate) async fn ready(&self) {
        self.ready.notified().await;
    }
}
