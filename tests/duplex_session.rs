use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use ringbuf::traits::Producer;
use voiceloop::messages::pcm_to_bytes;
use voiceloop::{mic_ring, DuplexConfig, DuplexEngine, PlaybackTracker, SessionEvent};

const BLOCK: usize = 960;
const FADE: usize = 288;

fn audio(samples: &[i16]) -> SessionEvent {
    SessionEvent::Audio {
        item_id: "resp_1".into(),
        content_index: 0,
        data: pcm_to_bytes(samples),
    }
}

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

fn expected_fade(value: i16, k: usize) -> i16 {
    (value as f32 * (1.0 - k as f32 / FADE as f32)) as i16
}

#[derive(Default)]
struct CountingTracker {
    bytes: AtomicU64,
}

impl PlaybackTracker for CountingTracker {
    fn on_play_bytes(&self, _item_id: &str, _content_index: u32, bytes: &[u8]) {
        self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
}

#[test]
fn threaded_session_plays_fragments_in_order() {
    let mut engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
    let mut scheduler = engine.output_scheduler();
    let (events_tx, events_rx) = unbounded();
    let (_prod, mic) = mic_ring(BLOCK * 4);
    let (sink, _sent) = unbounded::<Vec<u8>>();
    engine.start(events_rx, mic, sink).unwrap();

    let speech: Vec<i16> = (0..BLOCK * 3 + 500)
        .map(|i| (i % 2000) as i16 - 1000)
        .collect();
    let chunks: Vec<&[i16]> = speech.chunks(700).collect();
    for chunk in &chunks {
        events_tx.send(audio(chunk)).unwrap();
    }
    let state = engine.state().clone();
    assert!(wait_until(|| state.queue().len() == chunks.len()));

    let mut out = Vec::new();
    let mut block = vec![0i16; BLOCK];
    for _ in 0..5 {
        scheduler.render(&mut block);
        out.extend_from_slice(&block);
    }
    assert_eq!(&out[..speech.len()], &speech[..]);
    assert!(out[speech.len()..].iter().all(|&s| s == 0));

    engine.stop();
    let stats = engine.stats();
    assert_eq!(stats.frames_enqueued, chunks.len() as u64);
    assert_eq!(stats.frames_finished, chunks.len() as u64);
    assert_eq!(stats.samples_rendered, speech.len() as u64);
}

#[test]
fn local_barge_in_fades_and_flushes() {
    let tracker = Arc::new(CountingTracker::default());
    let engine = DuplexEngine::new(DuplexConfig::default())
        .unwrap()
        .with_playback_tracker(tracker.clone());
    let mut scheduler = engine.output_scheduler();
    let dispatcher = engine.dispatcher();
    let (mut prod, mic) = mic_ring(BLOCK * 8);
    let (sink, sent) = unbounded::<Vec<u8>>();
    let mut capture = engine.capture_loop(mic, sink);
    let state = engine.state().clone();

    for _ in 0..3 {
        dispatcher.dispatch(audio(&[8000; BLOCK * 2]));
    }
    let mut block = vec![0i16; BLOCK];
    scheduler.render(&mut block);
    assert!(block.iter().all(|&s| s == 8000));
    assert!(state.assistant_playing());

    // Normalized RMS 0.2: well above the echo guard for this playback level.
    for _ in 0..4 {
        assert_eq!(prod.push_slice(&[6554; BLOCK]), BLOCK);
        capture.poll_once().unwrap();
    }
    assert!(state.interrupt_pending());
    assert_eq!(sent.len(), 1);

    scheduler.render(&mut block);
    for (k, &s) in block[..FADE].iter().enumerate() {
        assert_eq!(s, expected_fade(8000, k), "sample {k}");
    }
    assert!(block[FADE..].iter().all(|&s| s == 0));

    assert!(!state.interrupt_pending());
    assert!(state.queue().is_empty());
    assert!(state.is_prebuffering());
    assert!(!state.assistant_playing());
    assert_eq!(
        tracker.bytes.load(Ordering::Relaxed),
        ((BLOCK + FADE) * 2) as u64
    );

    let stats = engine.stats();
    assert_eq!(stats.barge_ins, 1);
    assert_eq!(stats.fades_completed, 1);
    assert_eq!(stats.frames_flushed, 3);
}

#[test]
fn server_interrupt_then_new_response_waits_for_prebuffer() {
    let engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
    let mut scheduler = engine.output_scheduler();
    let dispatcher = engine.dispatcher();
    let state = engine.state().clone();
    let mut block = vec![0i16; BLOCK];

    for _ in 0..3 {
        dispatcher.dispatch(audio(&[1000; BLOCK]));
    }
    scheduler.render(&mut block);
    // Mid-frame so the fade has room.
    scheduler.render(&mut block[..BLOCK / 2]);

    dispatcher.dispatch(SessionEvent::AudioInterrupted);
    scheduler.render(&mut block);
    assert_eq!(block[0], 1000);
    assert!(block[FADE..].iter().all(|&s| s == 0));
    assert!(state.queue().is_empty());

    dispatcher.dispatch(audio(&[-500; BLOCK]));
    dispatcher.dispatch(audio(&[-500; BLOCK]));
    scheduler.render(&mut block);
    assert!(block.iter().all(|&s| s == 0));

    dispatcher.dispatch(audio(&[-500; BLOCK]));
    scheduler.render(&mut block);
    assert!(block.iter().all(|&s| s == -500));
}

#[test]
fn interrupt_while_prebuffering_flushes_immediately() {
    let engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
    let mut scheduler = engine.output_scheduler();
    let dispatcher = engine.dispatcher();
    let state = engine.state().clone();

    dispatcher.dispatch(audio(&[3000; BLOCK]));
    dispatcher.dispatch(audio(&[3000; BLOCK]));
    dispatcher.dispatch(SessionEvent::AudioInterrupted);

    let mut block = vec![7i16; BLOCK];
    scheduler.render(&mut block);
    assert!(block.iter().all(|&s| s == 0));
    assert!(state.queue().is_empty());
    assert!(!state.interrupt_pending());
    assert_eq!(engine.stats().immediate_flushes, 1);
}

#[test]
fn dropping_a_running_engine_joins_its_threads() {
    let mut engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
    let (events_tx, events_rx) = unbounded::<SessionEvent>();
    let (_prod, mic) = mic_ring(BLOCK);
    let (sink, _sent) = unbounded::<Vec<u8>>();
    engine.start(events_rx, mic, sink).unwrap();
    drop(engine);
    assert!(events_tx.send(SessionEvent::HistoryUpdated).is_err());
}

#[test]
fn restart_resets_stats() {
    let mut engine = DuplexEngine::new(DuplexConfig::default()).unwrap();
    for _ in 0..2 {
        let (events_tx, events_rx) = unbounded();
        let (_prod, mic) = mic_ring(BLOCK);
        let (sink, _sent) = unbounded::<Vec<u8>>();
        engine.start(events_rx, mic, sink).unwrap();
        events_tx.send(audio(&[1; 16])).unwrap();
        drop(events_tx);
        let stats = engine.stats_handle();
        assert!(wait_until(|| stats.snapshot().events_dispatched == 1));
        engine.stop();
    }
    assert_eq!(engine.stats().frames_enqueued, 1);
}
