use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

pub mod barge_in;
pub mod capture;
pub mod config;
#[cfg(feature = "device")]
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod jitter;
pub mod level;
pub mod messages;
pub mod playback;
pub mod session;
pub mod state;
pub mod stats;
pub mod status;

pub use barge_in::{BargeInDecision, BargeInPolicy, EchoGuard, PlaybackSnapshot, ServerVad};
pub use capture::{mic_ring, CaptureLoop, CaptureStep, MicSource, RingMicSource};
pub use config::{BargeInMode, DuplexConfig};
pub use dispatcher::{Dispatched, EventDispatcher};
pub use error::EngineError;
pub use jitter::JitterBuffer;
pub use messages::{AudioFrame, SessionEvent};
pub use playback::{FadeState, OutputScheduler, PlaybackCursor};
pub use session::{AudioSink, PlaybackTracker};
pub use state::DuplexState;
pub use stats::{RuntimeStats, RuntimeStatsHandle};
pub use status::{status_channel, DeviceStatus, StatusMonitor, StatusReporter};

/// One duplex session: owns the shared state and the background loops.
///
/// The render callback ([`OutputScheduler`]), the capture loop
/// ([`CaptureLoop`]) and the event dispatcher ([`EventDispatcher`]) all
/// share one [`DuplexState`].
pub struct DuplexEngine {
    config: DuplexConfig,
    state: Arc<DuplexState>,
    stats: RuntimeStatsHandle,
    tracker: Option<Arc<dyn PlaybackTracker>>,
    status: StatusReporter,
    monitor: StatusMonitor,
    threads: Vec<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

impl DuplexEngine {
    pub fn new(config: DuplexConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let (status, monitor) = status_channel(config.status_queue_capacity);
        Ok(Self {
            config,
            state: Arc::new(DuplexState::new()),
            stats: RuntimeStatsHandle::new(),
            tracker: None,
            status,
            monitor,
            threads: Vec::new(),
            stop_tx: None,
        })
    }

    pub fn with_playback_tracker(mut self, tracker: Arc<dyn PlaybackTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &DuplexConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<DuplexState> {
        &self.state
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> RuntimeStatsHandle {
        self.stats.clone()
    }

    pub fn status_reporter(&self) -> StatusReporter {
        self.status.clone()
    }

    pub fn status_monitor(&self) -> StatusMonitor {
        self.monitor.clone()
    }

    /// Render-side owner. Hand exactly one of these to the output device.
    pub fn output_scheduler(&self) -> OutputScheduler {
        OutputScheduler::new(self.state.clone(), &self.config, self.stats.clone())
            .with_tracker(self.tracker.clone())
            .with_status(self.status.clone())
    }

    pub fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher::new(self.state.clone(), self.stats.clone())
    }

    pub fn capture_loop<S: MicSource, K: AudioSink>(&self, source: S, sink: K) -> CaptureLoop<S, K> {
        CaptureLoop::new(source, sink, self.state.clone(), &self.config, self.stats.clone())
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }

    /// Spawns the dispatcher, capture and status threads. Rendering is
    /// driven by whoever owns the [`OutputScheduler`].
    pub fn start<S, K>(&mut self, events: Receiver<SessionEvent>, mic: S, sink: K) -> Result<()>
    where
        S: MicSource + 'static,
        K: AudioSink + 'static,
    {
        // Ensure previous run is fully stopped before starting a new one.
        self.stop();
        self.stats.reset();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        self.stop_tx = Some(stop_tx);

        if let Err(e) = self.spawn_loops(events, mic, sink, stop_rx) {
            self.stop();
            return Err(e);
        }
        info!(
            mode = %self.config.barge_in_mode,
            sample_rate = self.config.sample_rate,
            block_ms = self.config.block_ms,
            "duplex engine started"
        );
        Ok(())
    }

    fn spawn_loops<S, K>(
        &mut self,
        events: Receiver<SessionEvent>,
        mic: S,
        sink: K,
        stop_rx: Receiver<()>,
    ) -> Result<()>
    where
        S: MicSource + 'static,
        K: AudioSink + 'static,
    {
        let dispatcher = self.dispatcher();
        let stop = stop_rx.clone();
        let handle = std::thread::Builder::new()
            .name("voiceloop-dispatch".into())
            .spawn(move || dispatcher.run(&events, &stop))
            .context("spawning dispatcher thread")?;
        self.threads.push(handle);

        let mut capture = self.capture_loop(mic, sink);
        let stop = stop_rx.clone();
        let handle = std::thread::Builder::new()
            .name("voiceloop-capture".into())
            .spawn(move || capture.run(&stop))
            .context("spawning capture thread")?;
        self.threads.push(handle);

        let monitor = self.monitor.clone();
        let handle = std::thread::Builder::new()
            .name("voiceloop-status".into())
            .spawn(move || supervise_status(&monitor, &stop_rx))
            .context("spawning status thread")?;
        self.threads.push(handle);
        Ok(())
    }

    /// Signals every loop to exit and joins them.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            drop(stop_tx);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("engine thread panicked");
            }
        }
    }
}

impl Drop for DuplexEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise_status(monitor: &StatusMonitor, stop_rx: &Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            recv(monitor.receiver()) -> msg => match msg {
                Ok(status) => StatusMonitor::log(&status),
                Err(_) => break,
            },
        }
    }
    monitor.drain();
    if monitor.dropped() > 0 {
        warn!(dropped = monitor.dropped(), "device status records were dropped");
    }
    debug!("status supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = DuplexConfig {
            barge_in_frames_required: 0,
            ..DuplexConfig::default()
        };
        assert!(DuplexEngine::new(config).is_err());
    }

    #[test]
    fn start_and_stop_join_all_loops() {
        let mut engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (_prod, mic) = mic_ring(960 * 4);
        let (sink, _sent) = crossbeam_channel::unbounded::<Vec<u8>>();

        engine.start(events_rx, mic, sink).unwrap();
        assert!(engine.is_running());

        events_tx
            .send(SessionEvent::Audio {
                item_id: "item".into(),
                content_index: 0,
                data: vec![0, 1, 0, 1],
            })
            .unwrap();
        let state = engine.state().clone();
        assert!(wait_until(|| state.queue().len() == 1));

        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(engine.stats().frames_enqueued, 1);
    }

    #[test]
    fn status_records_reach_supervisor() {
        let mut engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
        let (_events_tx, events_rx) = crossbeam_channel::unbounded::<SessionEvent>();
        let (_prod, mic) = mic_ring(960);
        let (sink, _sent) = crossbeam_channel::unbounded::<Vec<u8>>();
        engine.start(events_rx, mic, sink).unwrap();

        let reporter = engine.status_reporter();
        for dropped_samples in 1..=5 {
            reporter.report(DeviceStatus::CaptureOverrun { dropped_samples });
        }
        let monitor = engine.status_monitor();
        assert!(wait_until(|| monitor.receiver().is_empty()));
        assert_eq!(monitor.dropped(), 0);
        assert_eq!(reporter.dropped(), 0);
        engine.stop();
    }
}
