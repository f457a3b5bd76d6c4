use crate::config::{BargeInMode, DuplexConfig};

/// What the capture loop should do with one mic block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BargeInDecision {
    pub forward: bool,
    pub interrupt: bool,
}

impl BargeInDecision {
    pub const FORWARD: Self = Self {
        forward: true,
        interrupt: false,
    };
    pub const SUPPRESS: Self = Self {
        forward: false,
        interrupt: false,
    };
    pub const BARGE_IN: Self = Self {
        forward: true,
        interrupt: true,
    };
}

/// Stale view of playback taken by the capture loop for one block.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub assistant_playing: bool,
    pub recent_playback_rms: f32,
}

/// Decides, per mic block, whether to stream it and whether the user is
/// interrupting. Selected once from [`BargeInMode`].
pub trait BargeInPolicy: Send {
    fn evaluate(&mut self, mic_rms: f32, playback: PlaybackSnapshot) -> BargeInDecision;

    fn reset(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Streams everything and leaves interruption to the remote session.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerVad;

impl BargeInPolicy for ServerVad {
    fn evaluate(&mut self, _mic_rms: f32, _playback: PlaybackSnapshot) -> BargeInDecision {
        BargeInDecision::FORWARD
    }

    fn name(&self) -> &'static str {
        "server"
    }
}

/// Local RMS detector with echo suppression.
///
/// While the assistant is audible, mic blocks are held back unless they are
/// louder than both the base threshold and a multiple of recent playback
/// loudness. `frames_required` consecutive such blocks declare a barge-in;
/// any quieter block resets the run.
#[derive(Clone, Debug)]
pub struct EchoGuard {
    energy_threshold: f32,
    echo_suppress_multiplier: f32,
    frames_required: u32,
    active_frames: u32,
}

impl EchoGuard {
    pub fn new(energy_threshold: f32, echo_suppress_multiplier: f32, frames_required: u32) -> Self {
        Self {
            energy_threshold,
            echo_suppress_multiplier,
            frames_required: frames_required.max(1),
            active_frames: 0,
        }
    }

    pub fn from_config(config: &DuplexConfig) -> Self {
        Self::new(
            config.energy_threshold,
            config.echo_suppress_multiplier,
            config.barge_in_frames_required,
        )
    }

    pub fn guard_threshold(&self, recent_playback_rms: f32) -> f32 {
        self.energy_threshold
            .max(recent_playback_rms * self.echo_suppress_multiplier)
    }

    pub fn active_frames(&self) -> u32 {
        self.active_frames
    }
}

impl BargeInPolicy for EchoGuard {
    fn evaluate(&mut self, mic_rms: f32, playback: PlaybackSnapshot) -> BargeInDecision {
        if !playback.assistant_playing {
            self.active_frames = 0;
            return BargeInDecision::FORWARD;
        }

        if mic_rms >= self.guard_threshold(playback.recent_playback_rms) {
            self.active_frames = self.active_frames.saturating_add(1);
            if self.active_frames >= self.frames_required {
                return BargeInDecision::BARGE_IN;
            }
        } else {
            self.active_frames = 0;
        }
        BargeInDecision::SUPPRESS
    }

    fn reset(&mut self) {
        self.active_frames = 0;
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

pub fn policy_for(config: &DuplexConfig) -> Box<dyn BargeInPolicy> {
    match config.barge_in_mode {
        BargeInMode::Server => Box::new(ServerVad),
        BargeInMode::Local => Box::new(EchoGuard::from_config(config)),
    }
}
