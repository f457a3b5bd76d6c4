use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDirection {
    Input,
    Output,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceStatus {
    /// Error reported by the device layer for a stream.
    Stream { direction: StreamDirection, message: String },
    /// Mic ring buffer was full; samples were dropped.
    CaptureOverrun { dropped_samples: usize },
    /// Render callback took longer than one block period.
    RenderOverrun { elapsed_us: u64, budget_us: u64 },
}

/// Sending half held by the device callbacks, which have no other way to
/// return an error.
#[derive(Clone, Debug)]
pub struct StatusReporter {
    tx: Sender<DeviceStatus>,
    dropped: Arc<AtomicU64>,
}

impl StatusReporter {
    /// Never blocks. A full or closed queue drops the record and counts it.
    pub fn report(&self, status: DeviceStatus) {
        match self.tx.try_send(status) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct StatusMonitor {
    rx: Receiver<DeviceStatus>,
    dropped: Arc<AtomicU64>,
}

impl StatusMonitor {
    pub fn receiver(&self) -> &Receiver<DeviceStatus> {
        &self.rx
    }

    pub fn log(status: &DeviceStatus) {
        match status {
            DeviceStatus::Stream { direction, message } => {
                warn!(%direction, %message, "audio stream error");
            }
            DeviceStatus::CaptureOverrun { dropped_samples } => {
                warn!(dropped_samples, "mic buffer overrun");
            }
            DeviceStatus::RenderOverrun { elapsed_us, budget_us } => {
                warn!(elapsed_us, budget_us, "render callback over budget");
            }
        }
    }

    /// Logs everything currently queued and returns how many records it saw.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        for status in self.rx.try_iter() {
            Self::log(&status);
            n += 1;
        }
        n
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn status_channel(capacity: usize) -> (StatusReporter, StatusMonitor) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        StatusReporter {
            tx,
            dropped: dropped.clone(),
        },
        StatusMonitor { rx, dropped },
    )
}
