use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EngineError;

/// How user interruptions are detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BargeInMode {
    /// Always stream the mic; the remote session's VAD declares interruptions.
    Server,
    /// Local RMS detector with echo guard.
    #[default]
    Local,
}

impl FromStr for BargeInMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "local" | "rms" => Ok(Self::Local),
            other => Err(EngineError::config(
                "barge_in_mode",
                format!("unknown mode `{other}`, expected `server` or `local`"),
            )),
        }
    }
}

impl fmt::Display for BargeInMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Local => f.write_str("local"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DuplexConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Length of one render/capture block.
    pub block_ms: u32,
    /// Frames that must be queued before the first sample is played.
    pub prebuffer_chunks: usize,
    pub fade_out_ms: u32,
    /// Floor of the barge-in guard, in normalized RMS.
    pub energy_threshold: f32,
    /// Mic RMS must exceed recent playback RMS by this factor.
    pub echo_suppress_multiplier: f32,
    /// Consecutive loud blocks needed to declare a barge-in.
    pub barge_in_frames_required: u32,
    pub barge_in_mode: BargeInMode,
    /// EMA smoothing for the playback loudness estimate.
    pub playback_rms_alpha: f32,
    /// Retry delay when less than one block of mic audio is buffered.
    pub capture_poll_ms: u64,
    pub status_queue_capacity: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            block_ms: 40,
            prebuffer_chunks: 3,
            fade_out_ms: 12,
            energy_threshold: 0.015,
            echo_suppress_multiplier: 1.8,
            barge_in_frames_required: 4,
            barge_in_mode: BargeInMode::Local,
            playback_rms_alpha: 0.2,
            capture_poll_ms: 10,
            status_queue_capacity: 64,
        }
    }
}

impl DuplexConfig {
    /// Samples in one render callback / capture read (960 at the defaults).
    pub fn samples_per_block(&self) -> usize {
        (self.sample_rate as u64 * self.block_ms as u64 / 1000) as usize
    }

    /// Configured fade-out length in samples (288 at the defaults).
    pub fn fade_samples(&self) -> usize {
        (self.sample_rate as u64 * self.fade_out_ms as u64 / 1000) as usize
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms as u64)
    }

    pub fn capture_poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture_poll_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate == 0 {
            return Err(EngineError::config("sample_rate", "must be positive"));
        }
        if self.channels != 1 {
            return Err(EngineError::config("channels", "only mono is supported"));
        }
        if self.block_ms == 0 || self.samples_per_block() == 0 {
            return Err(EngineError::config("block_ms", "block must hold at least one sample"));
        }
        if self.prebuffer_chunks == 0 {
            return Err(EngineError::config("prebuffer_chunks", "must be at least 1"));
        }
        if !self.energy_threshold.is_finite() || self.energy_threshold < 0.0 {
            return Err(EngineError::config(
                "energy_threshold",
                "must be a finite, non-negative RMS value",
            ));
        }
        if !self.echo_suppress_multiplier.is_finite() || self.echo_suppress_multiplier <= 0.0 {
            return Err(EngineError::config(
                "echo_suppress_multiplier",
                "must be finite and positive",
            ));
        }
        if self.barge_in_frames_required == 0 {
            return Err(EngineError::config("barge_in_frames_required", "must be at least 1"));
        }
        if !(self.playback_rms_alpha > 0.0 && self.playback_rms_alpha <= 1.0) {
            return Err(EngineError::config("playback_rms_alpha", "must be in (0, 1]"));
        }
        if self.status_queue_capacity == 0 {
            return Err(EngineError::config("status_queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}
