use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig};
use dasp::Sample;
use ringbuf::traits::Producer;
use ringbuf::HeapProd;
use tracing::info;

use crate::capture::{mic_ring, RingMicSource};
use crate::playback::OutputScheduler;
use crate::status::{DeviceStatus, StatusReporter, StreamDirection};
use crate::DuplexEngine;

/// One second of mic audio at the default block size.
const MIC_RING_BLOCKS: usize = 25;

/// Open device streams. Dropping this pauses and closes both.
pub struct DeviceStreams {
    output: Stream,
    input: Stream,
}

impl DeviceStreams {
    pub fn pause(&self) -> Result<()> {
        self.input.pause().context("pausing input stream")?;
        self.output.pause().context("pausing output stream")?;
        Ok(())
    }
}

impl Drop for DeviceStreams {
    fn drop(&mut self) {
        let _ = self.input.pause();
        let _ = self.output.pause();
    }
}

/// Opens the default input and output devices at the engine's rate and
/// block size and starts both streams. The output callback owns the
/// engine's [`OutputScheduler`]; the input callback fills the mic ring.
pub fn open_duplex_streams(engine: &DuplexEngine) -> Result<(DeviceStreams, RingMicSource)> {
    let config = engine.config();
    let block = config.samples_per_block();
    let host = cpal::default_host();

    let output_device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no output audio device available"))?;
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no input audio device available"))?;
    info!(
        output = %output_device.name().unwrap_or_else(|_| "unknown".into()),
        input = %input_device.name().unwrap_or_else(|_| "unknown".into()),
        sample_rate = config.sample_rate,
        block,
        "opening audio devices"
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(block as u32),
    };

    let output_format = output_device
        .default_output_config()
        .context("querying output config")?
        .sample_format();
    let input_format = input_device
        .default_input_config()
        .context("querying input config")?
        .sample_format();

    let status = engine.status_reporter();
    let output = build_output_stream(
        &output_device,
        &stream_config,
        output_format,
        engine.output_scheduler(),
        status.clone(),
    )?;

    let (prod, mic) = mic_ring(block * MIC_RING_BLOCKS);
    let input = build_input_stream(&input_device, &stream_config, input_format, prod, status)?;

    let streams = DeviceStreams { output, input };
    streams.output.play().context("starting output stream")?;
    streams.input.play().context("starting input stream")?;
    Ok((streams, mic))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut scheduler: OutputScheduler,
    status: StatusReporter,
) -> Result<Stream> {
    let on_error = move |err: cpal::StreamError| {
        status.report(DeviceStatus::Stream {
            direction: StreamDirection::Output,
            message: err.to_string(),
        });
    };

    let stream = match format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| scheduler.render(data),
            on_error,
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch = vec![0i16; buffer_len(config)];
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0);
                    }
                    let pcm = &mut scratch[..data.len()];
                    scheduler.render(pcm);
                    for (dst, src) in data.iter_mut().zip(pcm.iter()) {
                        *dst = src.to_sample::<f32>();
                    }
                },
                on_error,
                None,
            )
        }
        other => bail!("unsupported output sample format: {other:?}"),
    };
    stream.context("building output stream")
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    mut prod: HeapProd<i16>,
    status: StatusReporter,
) -> Result<Stream> {
    let overrun_status = status.clone();
    let on_error = move |err: cpal::StreamError| {
        status.report(DeviceStatus::Stream {
            direction: StreamDirection::Input,
            message: err.to_string(),
        });
    };

    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let pushed = prod.push_slice(data);
                if pushed < data.len() {
                    overrun_status.report(DeviceStatus::CaptureOverrun {
                        dropped_samples: data.len() - pushed,
                    });
                }
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let dropped = data
                    .iter()
                    .filter(|s| prod.try_push(s.to_sample::<i16>()).is_err())
                    .count();
                if dropped > 0 {
                    overrun_status.report(DeviceStatus::CaptureOverrun {
                        dropped_samples: dropped,
                    });
                }
            },
            on_error,
            None,
        ),
        other => bail!("unsupported input sample format: {other:?}"),
    };
    stream.context("building input stream")
}

fn buffer_len(config: &StreamConfig) -> usize {
    match config.buffer_size {
        BufferSize::Fixed(n) => n as usize,
        BufferSize::Default => 4096,
    }
}
