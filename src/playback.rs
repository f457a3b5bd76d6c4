use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DuplexConfig;
use crate::level::{ema, rms_energy};
use crate::messages::{pcm_le_bytes, AudioFrame, BYTES_PER_SAMPLE};
use crate::session::PlaybackTracker;
use crate::state::DuplexState;
use crate::stats::{RenderTally, RuntimeStatsHandle};
use crate::status::{DeviceStatus, StatusReporter};

/// The frame currently being drained and how far into it playback is.
/// Invariant: `position <= frame.len()`.
#[derive(Debug, Default)]
pub struct PlaybackCursor {
    frame: Option<AudioFrame>,
    position: usize,
}

impl PlaybackCursor {
    pub fn frame(&self) -> Option<&AudioFrame> {
        self.frame.as_ref()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn remaining(&self) -> usize {
        self.frame
            .as_ref()
            .map(|f| f.len().saturating_sub(self.position))
            .unwrap_or(0)
    }

    fn clear(&mut self) -> Option<AudioFrame> {
        self.position = 0;
        self.frame.take()
    }
}

/// Linear fade-to-silence over the tail of the in-flight frame.
///
/// `samples_total` is fixed when the fade starts and never exceeds what is
/// left of that frame. After completion `active` drops to false and the
/// counters keep describing the last fade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FadeState {
    pub active: bool,
    pub samples_done: usize,
    pub samples_total: usize,
}

impl FadeState {
    fn start(configured: usize, remaining_in_frame: usize) -> Self {
        Self {
            active: true,
            samples_done: 0,
            samples_total: configured.min(remaining_in_frame),
        }
    }

    fn gain_at(&self, offset: usize) -> f32 {
        1.0 - offset as f32 / self.samples_total as f32
    }

    fn is_complete(&self) -> bool {
        self.samples_done >= self.samples_total
    }
}

/// Publishes what was just played: loudness for the echo guard, bytes for
/// the remote side's bookkeeping.
struct PlaybackMeter {
    state: Arc<DuplexState>,
    tracker: Option<Arc<dyn PlaybackTracker>>,
    alpha: f32,
    // Only written on big-endian targets.
    scratch: Vec<u8>,
}

impl PlaybackMeter {
    fn played(&mut self, frame: &AudioFrame, samples: &[i16]) {
        let block_rms = rms_energy(samples);
        if block_rms.is_finite() {
            let smoothed = ema(self.state.recent_playback_rms(), block_rms, self.alpha);
            self.state.store_playback_rms(smoothed);
        }

        if let Some(tracker) = &self.tracker {
            let bytes = pcm_le_bytes(samples, &mut self.scratch);
            // A misbehaving tracker must not take playback down with it.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                tracker.on_play_bytes(&frame.source_id, frame.content_index, bytes);
            }));
        }
    }
}

/// Render side: jitter-buffered playout with fade-out on interruption.
///
/// [`OutputScheduler::render`] is called once per device callback. It never
/// blocks: frames are dequeued with `try_recv` and stats are flushed with
/// `try_lock`.
pub struct OutputScheduler {
    state: Arc<DuplexState>,
    cursor: PlaybackCursor,
    fade: FadeState,
    fade_samples: usize,
    prebuffer_target: usize,
    sample_rate: u32,
    meter: PlaybackMeter,
    status: Option<StatusReporter>,
    stats: RuntimeStatsHandle,
    tally: RenderTally,
}

impl OutputScheduler {
    pub fn new(state: Arc<DuplexState>, config: &DuplexConfig, stats: RuntimeStatsHandle) -> Self {
        Self {
            meter: PlaybackMeter {
                state: state.clone(),
                tracker: None,
                alpha: config.playback_rms_alpha,
                scratch: Vec::with_capacity(config.samples_per_block() * BYTES_PER_SAMPLE),
            },
            state,
            cursor: PlaybackCursor::default(),
            fade: FadeState::default(),
            fade_samples: config.fade_samples(),
            prebuffer_target: config.prebuffer_chunks,
            sample_rate: config.sample_rate,
            status: None,
            stats,
            tally: RenderTally::default(),
        }
    }

    pub fn with_tracker(mut self, tracker: Option<Arc<dyn PlaybackTracker>>) -> Self {
        self.meter.tracker = tracker;
        self
    }

    pub fn with_status(mut self, status: StatusReporter) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cursor(&self) -> &PlaybackCursor {
        &self.cursor
    }

    pub fn fade_state(&self) -> FadeState {
        self.fade
    }

    /// Fills `out` with the next block of speaker audio.
    pub fn render(&mut self, out: &mut [i16]) {
        let started = Instant::now();
        self.tally.callbacks += 1;

        if self.state.interrupt_pending() {
            self.render_interrupt(out);
        } else {
            self.render_normal(out);
        }

        let elapsed = started.elapsed();
        self.tally.render_time.record(elapsed.as_nanos() as u64);
        self.check_budget(elapsed, out.len());
        self.stats.try_flush_render(&mut self.tally);
    }

    fn render_interrupt(&mut self, out: &mut [i16]) {
        out.fill(0);

        let Some(frame) = self.cursor.frame.as_ref() else {
            self.tally.frames_flushed += self.state.queue().clear() as u64;
            self.tally.immediate_flushes += 1;
            self.state.rearm_prebuffer();
            self.state.clear_interrupt();
            return;
        };

        if !self.fade.active {
            let remaining = frame.len().saturating_sub(self.cursor.position);
            self.fade = FadeState::start(self.fade_samples, remaining);
        }

        let mut filled = 0;
        while filled < out.len() && !self.fade.is_complete() {
            let n = (out.len() - filled).min(self.fade.samples_total - self.fade.samples_done);
            let pos = self.cursor.position;
            let src = &frame.samples[pos..pos + n];
            let dst = &mut out[filled..filled + n];

            for (i, (d, s)) in dst.iter_mut().zip(src).enumerate() {
                let gain = self.fade.gain_at(self.fade.samples_done + i);
                *d = (*s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
            self.meter.played(frame, dst);

            filled += n;
            self.cursor.position += n;
            self.fade.samples_done += n;
        }
        self.tally.samples_rendered += filled as u64;

        if self.fade.is_complete() {
            self.cursor.clear();
            self.state.set_frame_in_flight(false);
            self.tally.frames_flushed += 1 + self.state.queue().clear() as u64;
            self.tally.fades_completed += 1;
            self.fade.active = false;
            self.state.rearm_prebuffer();
            self.state.clear_interrupt();
        }
    }

    fn render_normal(&mut self, out: &mut [i16]) {
        out.fill(0);

        let mut filled = 0;
        while filled < out.len() {
            if self.cursor.frame.is_none() {
                let queued = self.state.queue().len();
                if self.state.is_prebuffering() && queued < self.prebuffer_target {
                    if queued > 0 {
                        self.tally.prebuffer_waits += 1;
                    }
                    break;
                }
                self.state.end_prebuffer();

                // Flag goes up before the pop so a dequeued frame is never
                // invisible to the capture loop.
                self.state.set_frame_in_flight(true);
                match self.state.queue().pop() {
                    Some(next) if next.is_empty() => {
                        self.tally.frames_started += 1;
                        self.tally.frames_finished += 1;
                        continue;
                    }
                    Some(next) => {
                        self.cursor.frame = Some(next);
                        self.cursor.position = 0;
                        self.tally.frames_started += 1;
                    }
                    None => {
                        self.state.set_frame_in_flight(false);
                        if filled > 0 {
                            self.tally.underruns += 1;
                        }
                        break;
                    }
                }
            }

            let Some(frame) = self.cursor.frame.as_ref() else {
                break;
            };
            let n = (out.len() - filled).min(self.cursor.remaining());
            let pos = self.cursor.position;
            let dst = &mut out[filled..filled + n];
            dst.copy_from_slice(&frame.samples[pos..pos + n]);
            self.meter.played(frame, dst);

            filled += n;
            self.cursor.position += n;

            // The flag stays up across the next pop attempt.
            if self.cursor.remaining() == 0 {
                self.cursor.clear();
                self.tally.frames_finished += 1;
            }
        }
        if self.cursor.frame.is_none() && self.state.queue().is_empty() {
            self.state.set_frame_in_flight(false);
        }
        self.tally.samples_rendered += filled as u64;
    }

    fn check_budget(&self, elapsed: Duration, block_len: usize) {
        let Some(status) = &self.status else {
            return;
        };
        if self.sample_rate == 0 {
            return;
        }
        let budget_us = block_len as u64 * 1_000_000 / self.sample_rate as u64;
        let elapsed_us = elapsed.as_micros() as u64;
        if budget_us > 0 && elapsed_us > budget_us {
            status.report(DeviceStatus::RenderOverrun {
                elapsed_us,
                budget_us,
            });
        }
    }
}
