use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageStats {
    pub samples: u64,
    pub total_ns: u128,
    pub max_ns: u64,
}

impl StageStats {
    pub fn record(&mut self, duration_ns: u64) {
        self.samples += 1;
        self.total_ns += duration_ns as u128;
        self.max_ns = self.max_ns.max(duration_ns);
    }

    pub fn merge(&mut self, other: &StageStats) {
        self.samples += other.samples;
        self.total_ns += other.total_ns;
        self.max_ns = self.max_ns.max(other.max_ns);
    }

    pub fn avg_ns(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ns as f64 / self.samples as f64
        }
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_ns() / 1_000_000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ns as f64 / 1_000_000.0
    }
}

/// Counters owned by the render callback between flushes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderTally {
    pub callbacks: u64,
    pub samples_rendered: u64,
    pub frames_started: u64,
    pub frames_finished: u64,
    pub frames_flushed: u64,
    pub fades_completed: u64,
    pub immediate_flushes: u64,
    pub prebuffer_waits: u64,
    pub underruns: u64,
    pub render_time: StageStats,
}

impl RenderTally {
    fn apply(&self, s: &mut RuntimeStats) {
        s.render_callbacks += self.callbacks;
        s.samples_rendered += self.samples_rendered;
        s.frames_started += self.frames_started;
        s.frames_finished += self.frames_finished;
        s.frames_flushed += self.frames_flushed;
        s.fades_completed += self.fades_completed;
        s.immediate_flushes += self.immediate_flushes;
        s.prebuffer_waits += self.prebuffer_waits;
        s.underruns += self.underruns;
        s.render_time.merge(&self.render_time);
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeStats {
    // render callback
    pub render_callbacks: u64,
    pub samples_rendered: u64,
    pub frames_started: u64,
    pub frames_finished: u64,
    pub frames_flushed: u64,
    pub fades_completed: u64,
    pub immediate_flushes: u64,
    pub prebuffer_waits: u64,
    pub underruns: u64,
    pub render_time: StageStats,

    // event dispatcher
    pub events_dispatched: u64,
    pub dispatch_errors: u64,
    pub frames_enqueued: u64,
    pub empty_fragments: u64,
    pub server_interrupts: u64,

    // capture loop
    pub mic_blocks: u64,
    pub mic_blocks_forwarded: u64,
    pub mic_blocks_suppressed: u64,
    pub barge_ins: u64,
    pub send_errors: u64,
    pub capture_errors: u64,
}

#[derive(Clone, Debug)]
pub struct RuntimeStatsHandle {
    inner: Arc<Mutex<RuntimeStats>>,
}

impl RuntimeStatsHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RuntimeStats::default())),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut stats) = self.inner.lock() {
            *stats = RuntimeStats::default();
        }
    }

    pub fn update<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut RuntimeStats),
    {
        if let Ok(mut stats) = self.inner.lock() {
            update_fn(&mut stats);
        }
    }

    /// Non-blocking variant for the real-time thread. Returns `false` if the
    /// lock was contended and nothing was applied.
    pub fn try_update<F>(&self, update_fn: F) -> bool
    where
        F: FnOnce(&mut RuntimeStats),
    {
        match self.inner.try_lock() {
            Ok(mut stats) => {
                update_fn(&mut stats);
                true
            }
            Err(_) => false,
        }
    }

    /// Applies and clears `tally` unless the lock is contended, in which
    /// case the tally is kept for the next attempt.
    pub fn try_flush_render(&self, tally: &mut RenderTally) -> bool {
        let applied = self.try_update(|s| tally.apply(s));
        if applied {
            *tally = RenderTally::default();
        }
        applied
    }

    pub fn snapshot(&self) -> RuntimeStats {
        if let Ok(stats) = self.inner.lock() {
            stats.clone()
        } else {
            RuntimeStats::default()
        }
    }
}

impl Default for RuntimeStatsHandle {
    fn default() -> Self {
        Self::new()
    }
}
