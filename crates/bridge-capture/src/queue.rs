//! Bounded single-producer/single-consumer frame ring.
//!
//! Every slot owns a pre-allocated buffer sized to the maximum expected
//! frame, so pushing copies into place and never allocates. When the ring
//! is full the oldest slot is discarded before the new frame is written:
//! consumers always observe the newest frames (latency beats completeness
//! on this path). Backend buffers must be requeued to the kernel
//! immediately, which is why push copies.
//!
//! Index protocol: the producer release-stores `tail` after filling a
//! slot, the consumer acquire-loads it; mirrored for `head`. The
//! discard-on-full step and the consumer's copy-out are serialized by the
//! same mutex that backs the timed wait, so the producer can only be
//! delayed by one in-flight copy.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::frame::VideoFormat;

/// Keep the producer and consumer indices on separate cache lines.
#[repr(align(64))]
struct Padded(AtomicUsize);

struct Slot {
    data: UnsafeCell<Box<[u8]>>,
    len: UnsafeCell<usize>,
    timestamp_ns: UnsafeCell<i64>,
    format: UnsafeCell<Option<VideoFormat>>,
}

impl Slot {
    fn new(frame_size: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0u8; frame_size].into_boxed_slice()),
            len: UnsafeCell::new(0),
            timestamp_ns: UnsafeCell::new(0),
            format: UnsafeCell::new(None),
        }
    }
}

/// A frame copied out of the queue.
#[derive(Debug, Default, Clone)]
pub struct OwnedFrame {
    pub data: Vec<u8>,
    pub timestamp_ns: i64,
    pub format: Option<VideoFormat>,
}

/// Outcome of [`FrameQueue::try_pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopResult {
    Frame,
    TimedOut,
    Stopped,
}

pub struct FrameQueue {
    slots: Box<[Slot]>,
    head: Padded,
    tail: Padded,
    dropped: AtomicU64,
    stopped: AtomicBool,
    frame_size: usize,
    /// Serializes consumer copy-out with the producer's discard-on-full,
    /// and backs the timed wait.
    lock: Mutex<()>,
    available: Condvar,
}

// SAFETY: slot contents are only touched by the single producer (at
// `tail`, outside the consumer's readable range) or under `lock` by the
// consumer; indices are atomics.
unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

impl FrameQueue {
    /// A queue able to hold `capacity` frames of at most `frame_size`
    /// bytes each. All slot memory is allocated up front.
    #[must_use]
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let slots = (0..capacity + 1).map(|_| Slot::new(frame_size)).collect();
        Self {
            slots,
            head: Padded(AtomicUsize::new(0)),
            tail: Padded(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            frame_size,
            lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copy a frame into the ring. Never blocks on a full queue: the
    /// oldest frame is discarded instead and `dropped` incremented.
    pub fn try_push(&self, data: &[u8], timestamp_ns: i64, format: &VideoFormat) {
        let tail = self.tail.0.load(Ordering::Relaxed);
        if self.next(tail) == self.head.0.load(Ordering::Acquire) {
            // Full: drop the oldest. Serialized with any in-flight pop.
            let _guard = self.lock.lock().unwrap();
            let head = self.head.0.load(Ordering::Relaxed);
            if self.next(tail) == head {
                self.head.0.store(self.next(head), Ordering::Release);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let slot = &self.slots[tail];
        // SAFETY: `tail` is outside the consumer's readable range
        // [head, tail), and there is exactly one producer.
        unsafe {
            let buf = &mut *slot.data.get();
            let len = data.len().min(self.frame_size);
            buf[..len].copy_from_slice(&data[..len]);
            *slot.len.get() = len;
            *slot.timestamp_ns.get() = timestamp_ns;
            *slot.format.get() = Some(*format);
        }
        self.tail.0.store(self.next(tail), Ordering::Release);
        self.available.notify_one();
    }

    /// Wait up to `timeout` for a frame, copying it into `out`.
    pub fn try_pop(&self, out: &mut OwnedFrame, timeout: Duration) -> PopResult {
        let mut guard = self.lock.lock().unwrap();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return PopResult::Stopped;
            }
            let head = self.head.0.load(Ordering::Relaxed);
            if head != self.tail.0.load(Ordering::Acquire) {
                let slot = &self.slots[head];
                // SAFETY: under `lock`, and the producer never writes the
                // head slot while the queue is non-empty.
                unsafe {
                    let buf = &*slot.data.get();
                    let len = *slot.len.get();
                    out.data.clear();
                    out.data.extend_from_slice(&buf[..len]);
                    out.timestamp_ns = *slot.timestamp_ns.get();
                    out.format = *slot.format.get();
                }
                self.head.0.store(self.next(head), Ordering::Release);
                return PopResult::Frame;
            }

            let (g, wait) = self.available.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if wait.timed_out() {
                return if self.stopped.load(Ordering::Acquire) {
                    PopResult::Stopped
                } else {
                    PopResult::TimedOut
                };
            }
        }
    }

    /// Discard everything currently queued.
    pub fn clear(&self) {
        let _guard = self.lock.lock().unwrap();
        let tail = self.tail.0.load(Ordering::Acquire);
        self.head.0.store(tail, Ordering::Release);
    }

    /// Wake all waiters; subsequent pops return [`PopResult::Stopped`].
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_convert::PixelFormat;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn fmt() -> VideoFormat {
        VideoFormat::new(2, 2, 4, PixelFormat::Yuyv)
    }

    fn push_n(queue: &FrameQueue, n: u8) {
        let f = fmt();
        for i in 0..n {
            queue.try_push(&[i; 8], i64::from(i), &f);
        }
    }

    #[test]
    fn fifo_within_capacity() {
        let queue = FrameQueue::new(8, 8);
        push_n(&queue, 5);

        let mut out = OwnedFrame::default();
        for i in 0..5u8 {
            assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::Frame);
            assert_eq!(out.data[0], i);
            assert_eq!(out.timestamp_ns, i64::from(i));
        }
        assert_eq!(queue.dropped(), 0);
        assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::TimedOut);
    }

    #[test]
    fn newest_wins_on_overflow() {
        let queue = FrameQueue::new(4, 8);
        push_n(&queue, 7);

        // The last 4 pushed survive, in order, and 3 were dropped.
        let mut out = OwnedFrame::default();
        for i in 3..7u8 {
            assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::Frame);
            assert_eq!(out.data[0], i);
        }
        assert_eq!(queue.dropped(), 3);
    }

    #[test]
    fn capacity_one_keeps_only_latest() {
        let queue = FrameQueue::new(1, 8);
        push_n(&queue, 5);

        let mut out = OwnedFrame::default();
        assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::Frame);
        assert_eq!(out.data[0], 4);
        assert_eq!(queue.dropped(), 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn stop_wakes_blocked_pop_quickly() {
        let queue = Arc::new(FrameQueue::new(2, 8));
        let waiter = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let mut out = OwnedFrame::default();
            let start = Instant::now();
            let result = waiter.try_pop(&mut out, Duration::from_millis(500));
            (result, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        queue.stop();
        let (result, elapsed) = handle.join().unwrap();
        assert_eq!(result, PopResult::Stopped);
        assert!(elapsed < Duration::from_millis(200), "woke after {elapsed:?}");
    }

    #[test]
    fn clear_empties_queue() {
        let queue = FrameQueue::new(4, 8);
        push_n(&queue, 3);
        queue.clear();
        assert!(queue.is_empty());

        let mut out = OwnedFrame::default();
        assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::TimedOut);
    }

    #[test]
    fn oversized_frames_truncate_to_slot() {
        let queue = FrameQueue::new(2, 4);
        queue.try_push(&[7u8; 64], 0, &fmt());
        let mut out = OwnedFrame::default();
        assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::Frame);
        assert_eq!(out.data.len(), 4);
    }

    proptest! {
        // Pushing capacity + k distinct frames always leaves the last
        // `capacity` frames, in order, with `dropped == k`.
        #[test]
        fn newest_wins_for_any_overflow(capacity in 1usize..8, extra in 0u8..20) {
            let queue = FrameQueue::new(capacity, 8);
            let total = capacity as u8 + extra;
            push_n(&queue, total);

            let mut out = OwnedFrame::default();
            for i in extra..total {
                prop_assert_eq!(queue.try_pop(&mut out, Duration::ZERO), PopResult::Frame);
                prop_assert_eq!(out.data[0], i);
            }
            prop_assert_eq!(queue.dropped(), u64::from(extra));
            prop_assert!(queue.is_empty());
        }
    }

    #[test]
    fn concurrent_producer_consumer_ordering() {
        let queue = Arc::new(FrameQueue::new(16, 8));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let f = fmt();
            for i in 0..200u8 {
                producer.try_push(&[i; 8], i64::from(i), &f);
                std::thread::yield_now();
            }
            producer.stop();
        });

        let mut out = OwnedFrame::default();
        let mut last = -1i64;
        loop {
            match queue.try_pop(&mut out, Duration::from_millis(100)) {
                PopResult::Frame => {
                    assert!(out.timestamp_ns > last, "out of order");
                    last = out.timestamp_ns;
                }
                PopResult::Stopped => break,
                PopResult::TimedOut => {}
            }
        }
        handle.join().unwrap();
    }
}
