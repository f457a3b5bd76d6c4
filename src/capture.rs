use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use ringbuf::traits::{Consumer, Observer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, info, warn};

use crate::barge_in::{policy_for, BargeInDecision, BargeInPolicy, PlaybackSnapshot};
use crate::config::DuplexConfig;
use crate::error::EngineError;
use crate::level::rms_energy;
use crate::messages::{pcm_le_bytes, BYTES_PER_SAMPLE};
use crate::session::AudioSink;
use crate::state::DuplexState;
use crate::stats::RuntimeStatsHandle;

/// Microphone samples waiting to be read. Reads never block: callers check
/// `available()` first and only read whole blocks.
pub trait MicSource: Send {
    fn available(&self) -> usize;

    fn read_block(&mut self, buf: &mut [i16]) -> Result<()>;
}

/// Consumer half of the SPSC ring the device input callback writes into.
pub struct RingMicSource {
    cons: HeapCons<i16>,
}

/// Creates the mic ring: the producer goes to the input callback, the
/// source to the capture loop.
pub fn mic_ring(capacity: usize) -> (HeapProd<i16>, RingMicSource) {
    let (prod, cons) = HeapRb::<i16>::new(capacity.max(1)).split();
    (prod, RingMicSource { cons })
}

impl MicSource for RingMicSource {
    fn available(&self) -> usize {
        self.cons.occupied_len()
    }

    fn read_block(&mut self, buf: &mut [i16]) -> Result<()> {
        let got = self.cons.pop_slice(buf);
        if got < buf.len() {
            return Err(EngineError::ShortRead {
                wanted: buf.len(),
                got,
            }
            .into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CaptureStep {
    /// Less than one block buffered; try again after the poll interval.
    Pending,
    Block { mic_rms: f32, decision: BargeInDecision },
}

/// Reads fixed-size mic blocks, runs the barge-in policy and forwards the
/// blocks it allows to the session.
pub struct CaptureLoop<S, K> {
    source: S,
    sink: K,
    policy: Box<dyn BargeInPolicy>,
    state: Arc<DuplexState>,
    block: Vec<i16>,
    bytes: Vec<u8>,
    poll_interval: Duration,
    stats: RuntimeStatsHandle,
}

impl<S: MicSource, K: AudioSink> CaptureLoop<S, K> {
    pub fn new(
        source: S,
        sink: K,
        state: Arc<DuplexState>,
        config: &DuplexConfig,
        stats: RuntimeStatsHandle,
    ) -> Self {
        let block_len = config.samples_per_block();
        Self {
            source,
            sink,
            policy: policy_for(config),
            state,
            block: vec![0; block_len],
            bytes: Vec::with_capacity(block_len * BYTES_PER_SAMPLE),
            poll_interval: config.capture_poll_interval(),
            stats,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn BargeInPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }

    /// Processes at most one block.
    pub fn poll_once(&mut self) -> Result<CaptureStep> {
        if self.source.available() < self.block.len() {
            return Ok(CaptureStep::Pending);
        }
        self.source.read_block(&mut self.block)?;

        let mic_rms = rms_energy(&self.block);
        let playback = PlaybackSnapshot {
            assistant_playing: self.state.assistant_playing(),
            recent_playback_rms: self.state.recent_playback_rms(),
        };
        let decision = self.policy.evaluate(mic_rms, playback);

        if decision.interrupt {
            let fresh = !self.state.interrupt_pending();
            self.state.request_interrupt();
            if fresh {
                info!(
                    mic_rms,
                    playback_rms = playback.recent_playback_rms,
                    "barge-in detected"
                );
                self.stats.update(|s| s.barge_ins += 1);
            }
        }

        let mut sent = false;
        let mut send_failed = false;
        if decision.forward {
            let pcm = pcm_le_bytes(&self.block, &mut self.bytes);
            match self.sink.send_audio(pcm) {
                Ok(()) => sent = true,
                Err(e) => {
                    warn!(error = %e, "failed to send mic audio");
                    send_failed = true;
                }
            }
        }

        self.stats.update(|s| {
            s.mic_blocks += 1;
            if sent {
                s.mic_blocks_forwarded += 1;
            } else if !decision.forward {
                s.mic_blocks_suppressed += 1;
            }
            if send_failed {
                s.send_errors += 1;
            }
        });

        Ok(CaptureStep::Block { mic_rms, decision })
    }

    /// Polls until `stop_rx` receives or disconnects. Device and sink
    /// failures are logged and counted; the loop keeps going.
    pub fn run(&mut self, stop_rx: &Receiver<()>) {
        info!(
            policy = self.policy.name(),
            block_samples = self.block.len(),
            "capture loop started"
        );
        loop {
            match stop_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => break,
            }

            match self.poll_once() {
                Ok(CaptureStep::Block { .. }) => continue,
                Ok(CaptureStep::Pending) => {}
                Err(e) => {
                    warn!(error = %e, "mic read failed");
                    self.stats.update(|s| s.capture_errors += 1);
                }
            }

            match stop_rx.recv_timeout(self.poll_interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.policy.reset();
        debug!("capture loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BargeInMode;
    use crate::messages::AudioFrame;
    use crossbeam_channel::Sender;
    use ringbuf::traits::Producer;

    const BLOCK: usize = 960;

    struct Rig {
        prod: HeapProd<i16>,
        capture: CaptureLoop<RingMicSource, Sender<Vec<u8>>>,
        sent: Receiver<Vec<u8>>,
        state: Arc<DuplexState>,
        stats: RuntimeStatsHandle,
    }

    fn rig(mode: BargeInMode) -> Rig {
        let config = DuplexConfig {
            barge_in_mode: mode,
            capture_poll_ms: 1,
            ..DuplexConfig::default()
        };
        let (prod, source) = mic_ring(BLOCK * 16);
        let (tx, sent) = crossbeam_channel::unbounded();
        let state = Arc::new(DuplexState::new());
        let stats = RuntimeStatsHandle::new();
        let capture = CaptureLoop::new(source, tx, state.clone(), &config, stats.clone());
        Rig {
            prod,
            capture,
            sent,
            state,
            stats,
        }
    }

    // RMS of a constant block is amplitude / 32768.
    fn push_block(prod: &mut HeapProd<i16>, rms: f32) {
        let amp = (rms * 32_768.0).round() as i16;
        assert_eq!(prod.push_slice(&[amp; BLOCK]), BLOCK);
    }

    fn assistant_speaking(state: &DuplexState) {
        state.queue().push(AudioFrame::new(vec![0; BLOCK], "item", 0));
    }

    #[test]
    fn pending_until_full_block() {
        let mut r = rig(BargeInMode::Local);
        assert_eq!(r.prod.push_slice(&[0; BLOCK - 1]), BLOCK - 1);
        assert_eq!(r.capture.poll_once().unwrap(), CaptureStep::Pending);
        assert_eq!(r.prod.push_slice(&[0; 1]), 1);
        assert!(matches!(r.capture.poll_once().unwrap(), CaptureStep::Block { .. }));
    }

    #[test]
    fn idle_assistant_forwards_every_block() {
        let mut r = rig(BargeInMode::Local);
        for _ in 0..3 {
            push_block(&mut r.prod, 0.001);
            r.capture.poll_once().unwrap();
        }
        assert_eq!(r.sent.len(), 3);
        let bytes = r.sent.try_recv().unwrap();
        assert_eq!(bytes.len(), BLOCK * 2);
        let decoded = AudioFrame::from_pcm_bytes(&bytes, "mic", 0).unwrap();
        assert!(decoded.samples.iter().all(|&s| s == 33));
        assert!(!r.state.interrupt_pending());
    }

    #[test]
    fn debounced_barge_in_sends_only_triggering_block() {
        let mut r = rig(BargeInMode::Local);
        assistant_speaking(&r.state);

        for _ in 0..3 {
            push_block(&mut r.prod, 0.05);
            r.capture.poll_once().unwrap();
            assert!(!r.state.interrupt_pending());
        }
        assert!(r.sent.is_empty());

        push_block(&mut r.prod, 0.05);
        let step = r.capture.poll_once().unwrap();
        assert!(matches!(
            step,
            CaptureStep::Block { decision: BargeInDecision::BARGE_IN, .. }
        ));
        assert!(r.state.interrupt_pending());
        assert_eq!(r.sent.len(), 1);

        let snap = r.stats.snapshot();
        assert_eq!(snap.barge_ins, 1);
        assert_eq!(snap.mic_blocks, 4);
        assert_eq!(snap.mic_blocks_suppressed, 3);
        assert_eq!(snap.mic_blocks_forwarded, 1);
    }

    #[test]
    fn interrupted_run_needs_a_fresh_streak() {
        let mut r = rig(BargeInMode::Local);
        assistant_speaking(&r.state);
        for rms in [0.05, 0.05, 0.05, 0.001, 0.05, 0.05, 0.05] {
            push_block(&mut r.prod, rms);
            r.capture.poll_once().unwrap();
        }
        assert!(!r.state.interrupt_pending());
        assert!(r.sent.is_empty());
    }

    #[test]
    fn echo_of_playback_is_not_a_barge_in() {
        let mut r = rig(BargeInMode::Local);
        assistant_speaking(&r.state);
        r.state.store_playback_rms(0.02);
        for _ in 0..8 {
            push_block(&mut r.prod, 0.03);
            r.capture.poll_once().unwrap();
        }
        assert!(!r.state.interrupt_pending());
        assert_eq!(r.stats.snapshot().mic_blocks_suppressed, 8);
    }

    #[test]
    fn server_mode_streams_while_speaking() {
        let mut r = rig(BargeInMode::Server);
        assistant_speaking(&r.state);
        for _ in 0..6 {
            push_block(&mut r.prod, 0.3);
            r.capture.poll_once().unwrap();
        }
        assert_eq!(r.sent.len(), 6);
        assert!(!r.state.interrupt_pending());
    }

    #[test]
    fn sink_failure_is_counted_not_fatal() {
        let Rig {
            mut prod,
            mut capture,
            sent,
            stats,
            ..
        } = rig(BargeInMode::Local);
        drop(sent);
        push_block(&mut prod, 0.01);
        assert!(capture.poll_once().is_ok());
        assert_eq!(stats.snapshot().send_errors, 1);
    }

    #[test]
    fn short_read_surfaces_as_error() {
        struct Liar;
        impl MicSource for Liar {
            fn available(&self) -> usize {
                usize::MAX
            }
            fn read_block(&mut self, buf: &mut [i16]) -> Result<()> {
                Err(EngineError::ShortRead { wanted: buf.len(), got: 0 }.into())
            }
        }
        let (tx, _rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let mut capture = CaptureLoop::new(
            Liar,
            tx,
            Arc::new(DuplexState::new()),
            &DuplexConfig::default(),
            RuntimeStatsHandle::new(),
        );
        assert!(capture.poll_once().is_err());
    }

    #[test]
    fn run_exits_when_stop_sender_dropped() {
        let mut r = rig(BargeInMode::Local);
        for _ in 0..2 {
            push_block(&mut r.prod, 0.001);
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let sent = r.sent.clone();
        let mut capture = r.capture;
        let handle = std::thread::spawn(move || {
            capture.run(&stop_rx);
            capture
        });

        for _ in 0..2 {
            sent.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        drop(stop_tx);
        let capture = handle.join().unwrap();
        let (source, _) = capture.into_parts();
        assert_eq!(source.available(), 0);
    }
}
