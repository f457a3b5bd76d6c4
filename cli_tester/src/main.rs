use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use voiceloop::messages::pcm_to_bytes;
use voiceloop::{
    BargeInMode, DuplexConfig, DuplexEngine, MicSource, PlaybackTracker, RuntimeStats,
    SessionEvent,
};

const SAMPLE_RATE: u32 = 24_000;

/// Drive the duplex engine in virtual time from WAV files.
#[derive(Parser, Debug)]
#[command(name = "cli_tester", version)]
struct Args {
    /// Assistant speech, delivered as session audio fragments.
    #[arg(long)]
    speech: PathBuf,

    /// Microphone recording, fed one block per tick.
    #[arg(long)]
    mic: Option<PathBuf>,

    /// Where to write the rendered speaker output.
    #[arg(long, default_value = "speaker_out.wav")]
    out: PathBuf,

    /// Where to write the mic audio forwarded to the session.
    #[arg(long)]
    sent: Option<PathBuf>,

    #[arg(long, default_value_t = BargeInMode::Local)]
    mode: BargeInMode,

    /// Duration of each speech fragment.
    #[arg(long, default_value_t = 100)]
    fragment_ms: u32,

    /// Maximum extra delivery delay applied to fragments.
    #[arg(long, default_value_t = 0)]
    jitter_ms: u32,

    /// Inject a server-side interruption at this time.
    #[arg(long)]
    interrupt_at_ms: Option<u64>,
}

/// Mic recording released one block per tick, like a device filling a ring.
struct WavMic {
    samples: Vec<i16>,
    read: usize,
    released: usize,
}

impl WavMic {
    fn release(&mut self, n: usize) {
        self.released = (self.released + n).min(self.samples.len());
    }

    /// True once less than one block remains.
    fn exhausted(&self, block: usize) -> bool {
        self.samples.len() - self.read < block
    }
}

impl MicSource for WavMic {
    fn available(&self) -> usize {
        self.released - self.read
    }

    fn read_block(&mut self, buf: &mut [i16]) -> Result<()> {
        let end = self.read + buf.len();
        if end > self.released {
            bail!("mic read past released samples");
        }
        buf.copy_from_slice(&self.samples[self.read..end]);
        self.read = end;
        Ok(())
    }
}

#[derive(Default)]
struct ByteCounter {
    bytes: AtomicU64,
}

impl PlaybackTracker for ByteCounter {
    fn on_play_bytes(&self, _item_id: &str, _content_index: u32, bytes: &[u8]) {
        self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
}

struct Fragment {
    due_ms: u64,
    samples: Vec<i16>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if args.fragment_ms == 0 {
        bail!("--fragment-ms must be positive");
    }

    let config = DuplexConfig {
        barge_in_mode: args.mode,
        ..DuplexConfig::default()
    };
    let block = config.samples_per_block();
    let block_ms = config.block_ms as u64;

    let speech = read_wav(&args.speech)?;
    let fragments = schedule_fragments(&speech, args.fragment_ms, args.jitter_ms);
    let mic = match &args.mic {
        Some(path) => Some(WavMic {
            samples: read_wav(path)?,
            read: 0,
            released: 0,
        }),
        None => None,
    };
    info!(
        speech_samples = speech.len(),
        fragments = fragments.len(),
        mode = %args.mode,
        "starting simulation"
    );

    let counter = Arc::new(ByteCounter::default());
    let engine = DuplexEngine::new(config)?.with_playback_tracker(counter.clone());
    let mut scheduler = engine.output_scheduler();
    let dispatcher = engine.dispatcher();
    let (sink, sent_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let mut capture = mic.map(|m| engine.capture_loop(m, sink));

    let mut speaker = Vec::with_capacity(speech.len() + block * 8);
    let mut out_block = vec![0i16; block];
    let mut next_fragment = 0;
    let mut interrupt_sent = false;
    let max_ticks = tick_budget(&fragments, speech.len(), block, block_ms);

    for tick in 0..max_ticks {
        let now_ms = tick * block_ms;

        while next_fragment < fragments.len() && fragments[next_fragment].due_ms <= now_ms {
            dispatcher.dispatch(SessionEvent::Audio {
                item_id: "speech".into(),
                content_index: 0,
                data: pcm_to_bytes(&fragments[next_fragment].samples),
            });
            next_fragment += 1;
        }

        if let Some(at) = args.interrupt_at_ms {
            if !interrupt_sent && now_ms >= at {
                info!(at_ms = now_ms, "injecting server interruption");
                dispatcher.dispatch(SessionEvent::AudioInterrupted);
                interrupt_sent = true;
            }
        }

        scheduler.render(&mut out_block);
        speaker.extend_from_slice(&out_block);

        let mut mic_done = true;
        if let Some(capture) = capture.as_mut() {
            capture.source_mut().release(block);
            if let Err(e) = capture.poll_once() {
                warn!(error = %e, "capture step failed");
            }
            mic_done = capture.source_mut().exhausted(block);
        }

        let speech_done = next_fragment == fragments.len() && !engine.state().assistant_playing();
        if speech_done && mic_done {
            break;
        }
    }

    write_wav(&args.out, &speaker)?;
    if let Some(path) = &args.sent {
        let forwarded: Vec<i16> = sent_rx
            .try_iter()
            .flat_map(|bytes| {
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect::<Vec<_>>()
            })
            .collect();
        write_wav(path, &forwarded)?;
    }

    print_stats(&engine.stats(), counter.bytes.load(Ordering::Relaxed));
    Ok(())
}

/// Splits speech into fragments and assigns each a delivery time. Jitter is
/// a fixed pseudo-random sequence; delivery order is preserved.
fn schedule_fragments(speech: &[i16], fragment_ms: u32, jitter_ms: u32) -> Vec<Fragment> {
    let fragment_len = (SAMPLE_RATE as u64 * fragment_ms as u64 / 1000).max(1) as usize;
    let mut seed: u32 = 0x2545_f491;
    let mut last_due = 0u64;
    speech
        .chunks(fragment_len)
        .enumerate()
        .map(|(i, chunk)| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let jitter = if jitter_ms == 0 {
                0
            } else {
                ((seed >> 16) % (jitter_ms + 1)) as u64
            };
            let due = (i as u64 * fragment_ms as u64 + jitter).max(last_due);
            last_due = due;
            Fragment {
                due_ms: due,
                samples: chunk.to_vec(),
            }
        })
        .collect()
}

/// Generous bound so a stuck simulation still terminates: covers the last
/// fragment's delivery, however much jitter pushed it back, plus its playout.
fn tick_budget(fragments: &[Fragment], speech_len: usize, block: usize, block_ms: u64) -> u64 {
    let last_due_ms = fragments.last().map(|f| f.due_ms).unwrap_or(0);
    last_due_ms / block_ms.max(1) + (speech_len / block.max(1)) as u64 * 4 + 1_000
}

fn read_wav(path: &Path) -> Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.sample_rate != SAMPLE_RATE
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        bail!(
            "{}: expected 24 kHz mono 16-bit PCM, got {} Hz, {} ch, {} bits",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );
    }
    reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading {}", path.display()))
}

fn write_wav(path: &Path, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    info!(path = %path.display(), samples = samples.len(), "wrote wav");
    Ok(())
}

fn print_stats(stats: &RuntimeStats, tracked_bytes: u64) {
    println!("=== voiceloop simulation ===");
    println!(
        "render: {} callbacks, {} samples, avg {:.3} ms, max {:.3} ms",
        stats.render_callbacks,
        stats.samples_rendered,
        stats.render_time.avg_ms(),
        stats.render_time.max_ms()
    );
    println!(
        "frames: {} enqueued, {} started, {} finished, {} flushed, {} empty skipped",
        stats.frames_enqueued,
        stats.frames_started,
        stats.frames_finished,
        stats.frames_flushed,
        stats.empty_fragments
    );
    println!(
        "playout: {} prebuffer waits, {} underruns, {} fades, {} immediate flushes",
        stats.prebuffer_waits, stats.underruns, stats.fades_completed, stats.immediate_flushes
    );
    println!(
        "mic: {} blocks, {} forwarded, {} suppressed, {} barge-ins",
        stats.mic_blocks, stats.mic_blocks_forwarded, stats.mic_blocks_suppressed, stats.barge_ins
    );
    println!(
        "events: {} dispatched, {} errors, {} server interrupts",
        stats.events_dispatched, stats.dispatch_errors, stats.server_interrupts
    );
    println!("tracker: {tracked_bytes} bytes reported as played");
}
