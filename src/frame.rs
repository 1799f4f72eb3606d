// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Decoded video frames and the per-stream pre-roll ring.
//!
//! A [`Frame`] carries its pixel data in a [`Bytes`] buffer, so cloning a
//! frame shares the allocation. The recorder and the ring can therefore hold
//! on to frames without copying pixel data.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Process-wide anchor for monotonic frame timestamps.
static MONO_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds elapsed since the process-wide monotonic anchor.
pub fn mono_now_ns() -> i64 {
    MONO_ANCHOR.elapsed().as_nanos() as i64
}

/// Current wall time in milliseconds since the Unix epoch.
pub fn wall_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One decoded video frame, RGB8 row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture timestamp in nanoseconds.
    pub mono_ns: i64,
    /// Wall-clock capture timestamp in milliseconds since the Unix epoch.
    pub wall_ms: i64,
    pub width: u32,
    pub height: u32,
    /// RGB8 pixels, `width * height * 3` bytes. Shared between clones.
    pub pixels: Bytes,
}

impl Frame {
    /// Build a frame stamped with the current monotonic and wall clocks.
    pub fn now(width: u32, height: u32, pixels: Bytes) -> Self {
        Frame {
            mono_ns: mono_now_ns(),
            wall_ms: wall_now_ms(),
            width,
            height,
            pixels,
        }
    }

    /// Build a frame with explicit timestamps.
    pub fn at(mono_ns: i64, wall_ms: i64, width: u32, height: u32, pixels: Bytes) -> Self {
        Frame { mono_ns, wall_ms, width, height, pixels }
    }
}

/// Fixed-capacity FIFO of recent frames — the pre-roll source.
///
/// One writer (the capture task) pushes; readers snapshot. Pushing onto a
/// full ring drops the oldest frame, so the writer never blocks.
pub struct FrameRing {
    inner: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl FrameRing {
    /// Ring sized to hold `pre_buffer_seconds` of footage at `fps`.
    pub fn new(pre_buffer_seconds: u32, fps: u32) -> Self {
        let capacity = (pre_buffer_seconds as usize * fps as usize).max(1);
        FrameRing {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a frame, discarding the oldest when full.
    pub fn push(&self, frame: Frame) {
        let mut buf = self.inner.lock();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(frame);
    }

    /// Clone out the current contents in FIFO order.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Number of frames currently held.
    pub fn occupancy(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop all buffered frames. Called when a pipeline stops.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
