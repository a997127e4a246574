//! Application Types
//!
//! Frame handoff between the decode thread and render threads, and the
//! per-session time base.

use arc_swap::ArcSwapOption;
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::media::VideoFrame;

/// Consumed frame ids remembered for diagnostics
const RECENT_IDS: usize = 8;

/// Shared frame holder for zero-latency frame delivery
/// Decoder writes latest frame, renderer reads it - no buffering
///
/// Writes swap an `Arc` atomically, so readers see either the previous or
/// the new complete frame and never block the decoder.
pub struct SharedFrame {
    frame: ArcSwapOption<VideoFrame>,
    /// Id of the newest accepted frame (0 = none yet)
    latest_id: AtomicU64,
    /// Highest id returned by `read`
    last_read_id: AtomicU64,
    frame_count: AtomicU64,
    stale_writes: AtomicU64,
    recent: Mutex<VecDeque<u64>>,
}

impl SharedFrame {
    pub fn new() -> Self {
        Self {
            frame: ArcSwapOption::empty(),
            latest_id: AtomicU64::new(0),
            last_read_id: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
            stale_writes: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_IDS)),
        }
    }

    /// Write a new frame (called by decoder).
    /// A frame whose id is not newer than the held one is dropped.
    pub fn write(&self, frame: VideoFrame) -> bool {
        let id = frame.frame_id;
        let current = self.latest_id.load(Ordering::Acquire);
        if id <= current {
            self.stale_writes.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping stale frame {} (holding {})", id, current);
            return false;
        }

        self.frame.store(Some(Arc::new(frame)));
        self.latest_id.store(id, Ordering::Release);
        self.frame_count.fetch_add(1, Ordering::Release);
        true
    }

    /// Check if there's a new frame since last read
    pub fn has_new_frame(&self) -> bool {
        self.latest_id.load(Ordering::Acquire) > self.last_read_id.load(Ordering::Acquire)
    }

    /// Read the latest frame if it has not been returned before
    pub fn read(&self) -> Option<Arc<VideoFrame>> {
        let frame = self.frame.load_full()?;
        let previous = self.last_read_id.fetch_max(frame.frame_id, Ordering::AcqRel);
        if frame.frame_id > previous {
            self.remember(frame.frame_id);
            Some(frame)
        } else {
            None
        }
    }

    /// Latest frame without marking it consumed
    pub fn peek(&self) -> Option<Arc<VideoFrame>> {
        self.frame.load_full()
    }

    /// Independent reader with its own cursor
    pub fn reader(self: &Arc<Self>) -> FrameReader {
        FrameReader {
            slot: Arc::clone(self),
            cursor: 0,
        }
    }

    /// Drop the held frame. Ids already seen stay rejected.
    pub fn clear(&self) {
        self.frame.store(None);
    }

    /// Get frame count for stats
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Writes rejected for carrying an old id
    pub fn stale_writes(&self) -> u64 {
        self.stale_writes.load(Ordering::Relaxed)
    }

    pub fn latest_id(&self) -> u64 {
        self.latest_id.load(Ordering::Acquire)
    }

    /// Most recently consumed ids, oldest first
    pub fn recently_consumed(&self) -> Vec<u64> {
        self.recent.lock().iter().copied().collect()
    }

    fn remember(&self, id: u64) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_IDS {
            recent.pop_front();
        }
        recent.push_back(id);
    }
}

impl Default for SharedFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-reader view of a `SharedFrame`
pub struct FrameReader {
    slot: Arc<SharedFrame>,
    cursor: u64,
}

impl FrameReader {
    /// Next frame newer than anything this reader has returned
    pub fn read(&mut self) -> Option<Arc<VideoFrame>> {
        let frame = self.slot.peek()?;
        if frame.frame_id > self.cursor {
            self.cursor = frame.frame_id;
            self.slot.remember(frame.frame_id);
            Some(frame)
        } else {
            None
        }
    }

    pub fn has_new_frame(&self) -> bool {
        self.slot.latest_id() > self.cursor
    }

    /// Last id returned by this reader
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Session time base. Frame timestamps are microseconds since `start`.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { start }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Microseconds from session start to `at` (0 if `at` is earlier)
    pub fn elapsed_us(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.start).as_micros() as u64
    }

    pub fn now_us(&self) -> u64 {
        self.elapsed_us(Instant::now())
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(id: u64) -> VideoFrame {
        VideoFrame::solid(id, 4, 4, 16, 128, 128)
    }

    #[test]
    fn test_read_is_idempotent() {
        let slot = SharedFrame::new();
        assert!(slot.read().is_none());

        assert!(slot.write(frame(1)));
        assert!(slot.has_new_frame());
        assert_eq!(slot.read().map(|f| f.frame_id), Some(1));
        assert!(slot.read().is_none());
        assert!(!slot.has_new_frame());
        // Still held for peeking
        assert_eq!(slot.peek().map(|f| f.frame_id), Some(1));
    }

    #[test]
    fn test_stale_and_duplicate_writes_rejected() {
        let slot = SharedFrame::new();
        assert!(slot.write(frame(5)));
        assert!(!slot.write(frame(5)));
        assert!(!slot.write(frame(3)));
        assert_eq!(slot.stale_writes(), 2);
        assert_eq!(slot.frame_count(), 1);
        assert_eq!(slot.peek().map(|f| f.frame_id), Some(5));
    }

    #[test]
    fn test_readers_have_independent_cursors() {
        let slot = Arc::new(SharedFrame::new());
        let mut a = slot.reader();
        let mut b = slot.reader();

        slot.write(frame(1));
        assert_eq!(a.read().map(|f| f.frame_id), Some(1));
        assert!(a.read().is_none());
        assert_eq!(b.read().map(|f| f.frame_id), Some(1));

        slot.write(frame(2));
        slot.write(frame(3));
        assert_eq!(a.read().map(|f| f.frame_id), Some(3));
        assert_eq!(a.cursor(), 3);
        assert!(b.has_new_frame());
    }

    #[test]
    fn test_clear_keeps_id_floor() {
        let slot = SharedFrame::new();
        slot.write(frame(4));
        slot.clear();
        assert!(slot.peek().is_none());
        assert!(!slot.write(frame(2)));
        assert!(slot.write(frame(5)));
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let slot = SharedFrame::new();
        for id in 1..=20 {
            slot.write(frame(id));
            slot.read();
        }
        let recent = slot.recently_consumed();
        assert_eq!(recent.len(), RECENT_IDS);
        assert_eq!(recent.last(), Some(&20));
    }

    #[test]
    fn test_concurrent_readers_are_monotonic() {
        let slot = Arc::new(SharedFrame::new());
        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for id in 1..=2000 {
                    slot.write(frame(id));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mut reader = slot.reader();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..5000 {
                        if let Some(f) = reader.read() {
                            assert!(f.frame_id > last);
                            last = f.frame_id;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(slot.latest_id(), 2000);
    }

    #[test]
    fn test_session_clock() {
        let start = Instant::now();
        let clock = SessionClock::starting_at(start);
        assert_eq!(clock.elapsed_us(start + Duration::from_millis(3)), 3000);
        assert_eq!(clock.elapsed_us(start), 0);
    }
}
