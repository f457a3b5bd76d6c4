use std::sync::atomic::{AtomicBool, Ordering};

use atomic_float::AtomicF32;

use crate::jitter::JitterBuffer;

/// State shared by the render callback, the capture loop and the event
/// dispatcher. Everything here is lock-free.
///
/// Ownership of each field:
/// - `queue`: dispatcher pushes, render callback pops and flushes.
/// - `interrupt`: set by the dispatcher or capture loop, cleared only by the
///   render callback once fade-out or flush completes.
/// - `prebuffering`: re-armed by the dispatcher or render callback, cleared
///   by the render callback when playback starts.
/// - `frame_in_flight` and `playback_rms`: written by the render callback,
///   read as stale snapshots by the capture loop.
#[derive(Debug)]
pub struct DuplexState {
    queue: JitterBuffer,
    interrupt: AtomicBool,
    prebuffering: AtomicBool,
    frame_in_flight: AtomicBool,
    playback_rms: AtomicF32,
}

impl DuplexState {
    pub fn new() -> Self {
        Self {
            queue: JitterBuffer::new(),
            interrupt: AtomicBool::new(false),
            prebuffering: AtomicBool::new(true),
            frame_in_flight: AtomicBool::new(false),
            playback_rms: AtomicF32::new(0.0),
        }
    }

    pub fn queue(&self) -> &JitterBuffer {
        &self.queue
    }

    /// Latches an interruption; the render callback fades out and flushes.
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    pub fn rearm_prebuffer(&self) {
        self.prebuffering.store(true, Ordering::Release);
    }

    pub fn is_prebuffering(&self) -> bool {
        self.prebuffering.load(Ordering::Acquire)
    }

    pub(crate) fn end_prebuffer(&self) {
        self.prebuffering.store(false, Ordering::Release);
    }

    pub(crate) fn set_frame_in_flight(&self, in_flight: bool) {
        self.frame_in_flight.store(in_flight, Ordering::Release);
    }

    pub fn frame_in_flight(&self) -> bool {
        self.frame_in_flight.load(Ordering::Acquire)
    }

    /// True while a frame is being drained or any frame is queued.
    ///
    /// The queue is read first: the render callback raises `frame_in_flight`
    /// before it pops, so an empty queue observed here implies the flag of
    /// the popped frame is visible.
    pub fn assistant_playing(&self) -> bool {
        !self.queue.is_empty() || self.frame_in_flight()
    }

    pub fn recent_playback_rms(&self) -> f32 {
        self.playback_rms.load(Ordering::Relaxed)
    }

    pub(crate) fn store_playback_rms(&self, rms: f32) {
        self.playback_rms.store(rms, Ordering::Relaxed);
    }
}

impl Default for DuplexState {
    fn default() -> Self {
        Self::new()
    }
}
