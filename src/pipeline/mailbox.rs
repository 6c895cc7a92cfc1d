//! Single-slot frame mailbox between the delivery path and consumers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

use crate::capture::frame::Frame;
use crate::pipeline::stats::FrameStats;
use crate::{BridgeError, Result};

/// Newest-wins hand-off point for live frames
///
/// Holds at most one pending frame. Publishing over an unconsumed frame
/// discards the old one and counts it as dropped: latency wins over
/// completeness.
pub struct FrameBridge {
    slot: Mutex<Slot>,
    ready: Condvar,

    /// Counters are bumped under the slot lock so [`stats`](Self::stats)
    /// sees them consistent with the slot; the plain getters read them
    /// without locking so reporters never contend with delivery.
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    closed: bool,
    first_publish: Option<Instant>,
    last_publish: Option<Instant>,
}

#[derive(Default)]
struct Stats {
    total_delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Default for FrameBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBridge {
    /// New bridge, closed until a stream opens it.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                closed: true,
                ..Slot::default()
            }),
            ready: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: replace the pending frame and wake waiters
    pub fn publish(&self, frame: Frame) {
        let mut slot = self.lock();
        if slot.frame.replace(frame).is_some() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.total_delivered.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        slot.first_publish.get_or_insert(now);
        slot.last_publish = Some(now);
        drop(slot);

        self.ready.notify_all();
    }

    /// Consumer: move the pending frame out, never blocks
    pub fn take(&self) -> Option<Frame> {
        self.lock().frame.take()
    }

    pub fn has_frame(&self) -> bool {
        self.lock().frame.is_some()
    }

    /// Block until a frame is pending or `timeout` elapses.
    ///
    /// A frame already pending when the call starts counts, so a publish
    /// racing a failed `has_frame` is never missed. A zero timeout is a poll.
    /// Closing the bridge wakes every waiter with [`BridgeError::Stopped`].
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.lock();

        loop {
            if slot.frame.is_some() {
                return Ok(());
            }
            slot = self.park(slot, deadline)?;
        }
    }

    /// Block until a frame can be taken, then take it under the same lock.
    ///
    /// Losing a frame to another consumer keeps waiting until `timeout`.
    pub fn wait_take(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now().checked_add(timeout);
        let mut slot = self.lock();

        loop {
            if let Some(frame) = slot.frame.take() {
                return Ok(frame);
            }
            slot = self.park(slot, deadline)?;
        }
    }

    /// Sleep on the condvar once. `None` deadline waits without a timeout.
    fn park<'a>(
        &self,
        slot: MutexGuard<'a, Slot>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, Slot>> {
        if slot.closed {
            return Err(BridgeError::Stopped);
        }

        match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(BridgeError::Timeout);
                }
                Ok(self
                    .ready
                    .wait_timeout(slot, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0)
            }
            None => Ok(self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner)),
        }
    }

    /// Accept waiters again after a stream starts.
    pub fn open(&self) {
        self.lock().closed = false;
    }

    /// Wake every waiter; the pending frame and counters are kept.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Drop the pending frame and zero all counters.
    pub fn reset(&self) {
        let mut slot = self.lock();
        slot.frame = None;
        slot.first_publish = None;
        slot.last_publish = None;
        self.stats.total_delivered.store(0, Ordering::Relaxed);
        self.stats.dropped.store(0, Ordering::Relaxed);
    }

    pub fn total_frames(&self) -> u64 {
        self.stats.total_delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Consistent snapshot of the counters
    pub fn stats(&self) -> FrameStats {
        let slot = self.lock();
        FrameStats::new(
            self.stats.total_delivered.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
            slot.first_publish.zip(slot.last_publish),
            slot.frame.is_some(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::thread;

    fn frame(sequence: u64) -> Frame {
        Frame::new(
            Bytes::from_static(b"\xff\xd8\xff\xd9"),
            FrameMetadata {
                sequence,
                width: 2,
                height: 2,
                stride: 0,
                format: PixelFormat::Mjpeg,
                device_timestamp: None,
            },
        )
    }

    fn open_bridge() -> FrameBridge {
        let bridge = FrameBridge::new();
        bridge.open();
        bridge
    }

    #[test]
    fn publishes_without_take_drop_all_but_one() {
        let bridge = open_bridge();
        for seq in 1..=10 {
            bridge.publish(frame(seq));
        }
        assert_eq!(bridge.total_frames(), 10);
        assert_eq!(bridge.dropped_frames(), 9);
    }

    #[test]
    fn take_returns_newest_frame() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        bridge.publish(frame(2));
        bridge.publish(frame(3));

        assert_eq!(bridge.take().map(|f| f.sequence()), Some(3));
        assert!(bridge.take().is_none());

        bridge.publish(frame(4));
        assert_eq!(bridge.take().map(|f| f.sequence()), Some(4));
        assert_eq!(bridge.dropped_frames(), 2);
    }

    #[test]
    fn consumed_frames_are_not_dropped() {
        let bridge = open_bridge();
        for seq in 1..=5 {
            bridge.publish(frame(seq));
            assert!(bridge.take().is_some());
        }
        assert_eq!(bridge.dropped_frames(), 0);
        assert_eq!(bridge.total_frames(), 5);
    }

    #[test]
    fn zero_timeout_is_a_poll() {
        let bridge = open_bridge();
        assert!(matches!(bridge.wait(Duration::ZERO), Err(BridgeError::Timeout)));
        bridge.publish(frame(1));
        assert!(bridge.wait(Duration::ZERO).is_ok());
    }

    #[test]
    fn pending_frame_satisfies_wait_immediately() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        assert!(!bridge.is_closed());
        assert!(bridge.wait(Duration::from_secs(3600)).is_ok());
    }

    #[test]
    fn wait_times_out_without_publish() {
        let bridge = open_bridge();
        let started = Instant::now();
        assert!(matches!(
            bridge.wait(Duration::from_millis(30)),
            Err(BridgeError::Timeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_wakes_on_publish_from_another_thread() {
        let bridge = Arc::new(open_bridge());
        let producer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                bridge.publish(frame(7));
            })
        };

        let started = Instant::now();
        assert!(bridge.wait(Duration::from_secs(5)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(bridge.take().map(|f| f.sequence()), Some(7));
        producer.join().expect("producer thread");
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        assert!(bridge.wait(Duration::MAX).is_ok());
    }

    #[test]
    fn close_unblocks_waiters() {
        let bridge = Arc::new(open_bridge());
        let waiter = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.wait(Duration::MAX))
        };

        thread::sleep(Duration::from_millis(20));
        bridge.close();
        let result = waiter.join().expect("waiter thread");
        assert!(matches!(result, Err(BridgeError::Stopped)));
    }

    #[test]
    fn close_keeps_last_state() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        bridge.publish(frame(2));
        bridge.close();

        assert!(bridge.has_frame());
        assert_eq!(bridge.total_frames(), 2);
        assert_eq!(bridge.dropped_frames(), 1);
    }

    #[test]
    fn wait_take_hands_one_frame_to_one_consumer() {
        let bridge = Arc::new(open_bridge());
        bridge.publish(frame(1));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || bridge.wait_take(Duration::from_millis(40)))
            })
            .collect();
        let results: Vec<_> = consumers
            .into_iter()
            .map(|consumer| consumer.join().expect("consumer thread"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(BridgeError::Timeout)))
                .count(),
            1
        );
    }

    #[test]
    fn wait_take_reports_stop() {
        let bridge = open_bridge();
        bridge.close();
        assert!(matches!(
            bridge.wait_take(Duration::from_secs(1)),
            Err(BridgeError::Stopped)
        ));
    }

    #[test]
    fn counters_read_without_the_slot_lock() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        bridge.publish(frame(2));

        let _slot = bridge.lock();
        assert_eq!(bridge.total_frames(), 2);
        assert_eq!(bridge.dropped_frames(), 1);
    }

    #[test]
    fn reset_clears_slot_and_counters() {
        let bridge = open_bridge();
        bridge.publish(frame(1));
        bridge.publish(frame(2));
        bridge.reset();

        let stats = bridge.stats();
        assert_eq!(stats.total_frames, 0);
        assert_eq!(stats.dropped_frames, 0);
        assert!(!stats.pending);
    }
}
