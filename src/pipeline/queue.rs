//! Bounded-by-convention frame queue between pipeline stages

use log::warn;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::types::Frame;

/// Thread-safe FIFO of frame ownership handles.
///
/// The only legal way frames move between threads: a producer enqueues
/// (never blocking), a consumer blocks in [`FrameQueue::dequeue_blocking`]
/// until a frame or cancellation arrives. Dequeueing moves the frame out, so
/// the consumer becomes its sole owner.
///
/// Capacity is advisory. The queue itself never drops or reorders frames;
/// admission control belongs to callers. Crossing the advisory high-water
/// mark logs one warning per overflow episode so a stalled consumer is
/// visible long before memory pressure is.
pub struct FrameQueue {
    name: &'static str,
    advisory_capacity: usize,
    inner: Mutex<QueueInner>,
    in_cv: Condvar,
}

struct QueueInner {
    frames: VecDeque<Frame>,
    cancelled: bool,
    above_high_water: bool,
    overflows: u64,
}

impl FrameQueue {
    pub fn new(name: &'static str, advisory_capacity: usize) -> Self {
        Self {
            name,
            advisory_capacity,
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                cancelled: false,
                above_high_water: false,
                overflows: 0,
            }),
            in_cv: Condvar::new(),
        }
    }

    /// Append ownership of `frame` to the tail and wake one blocked
    /// consumer. Never blocks, never fails. A frame enqueued after
    /// cancellation is released immediately: the consumer is gone and a
    /// producer must be able to keep running while its downstream winds
    /// down.
    pub fn enqueue(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled {
            return;
        }
        inner.frames.push_back(frame);

        if inner.frames.len() > self.advisory_capacity {
            if !inner.above_high_water {
                inner.above_high_water = true;
                inner.overflows += 1;
                warn!(
                    "queue {}: {} frames buffered, above advisory capacity {}",
                    self.name,
                    inner.frames.len(),
                    self.advisory_capacity
                );
            }
        } else {
            inner.above_high_water = false;
        }

        drop(inner);
        self.in_cv.notify_one();
    }

    /// Block until a frame is available or the queue is cancelled.
    /// Returns `None` exactly when cancelled.
    pub fn dequeue_blocking(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        while inner.frames.is_empty() && !inner.cancelled {
            inner = self.in_cv.wait(inner).unwrap();
        }
        if inner.cancelled {
            return None;
        }
        inner.frames.pop_front()
    }

    /// Non-blocking dequeue; `None` when empty or cancelled.
    pub fn try_dequeue(&self) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled {
            return None;
        }
        inner.frames.pop_front()
    }

    /// Idempotent: wakes all blocked consumers, after which every dequeue
    /// returns `None` immediately. Frames still queued are dropped here:
    /// their owner of record is the queue and cancellation is the final
    /// exit path.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled = true;
        inner.frames.clear();
        drop(inner);
        self.in_cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of advisory-capacity overflow episodes so far.
    pub fn overflow_episodes(&self) -> u64 {
        self.inner.lock().unwrap().overflows
    }

    /// Inspect the head frame without removing it. The queue may change the
    /// moment the closure returns; callers that peek then dequeue must
    /// re-validate what they dequeued.
    pub fn peek_first<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.frames.front().map(f)
    }

    /// Inspect the tail frame without removing it. Same caveat as
    /// [`FrameQueue::peek_first`].
    pub fn peek_last<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.frames.back().map(f)
    }

    /// Inspect head and tail under one lock acquisition, for pacing math
    /// that needs a consistent span.
    pub fn peek_span<R>(&self, f: impl FnOnce(&Frame, &Frame) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        match (inner.frames.front(), inner.frames.back()) {
            (Some(first), Some(last)) => Some(f(first, last)),
            _ => None,
        }
    }
}
