//! Microphone and speaker backends on top of `cpal`.
//!
//! `cpal` streams are not `Send` on every platform, so each stream lives on a
//! dedicated thread that owns it until the handle is dropped.

use crate::sdk::pcm;
use crate::sdk::{AudioInput, AudioOutput, CaptureConfig, CaptureStream};
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use tokio::sync::mpsc;

const CAPTURE_QUEUE_BLOCKS: usize = 64;

fn find_device(name: Option<&str>, input: bool) -> std::result::Result<Device, String> {
    let host = cpal::default_host();
    tracing::debug!(host = ?host.id(), "Audio host");
    let Some(name) = name else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| "no default device".to_string());
    };
    let mut devices = if input {
        host.input_devices().map_err(|e| e.to_string())?
    } else {
        host.output_devices().map_err(|e| e.to_string())?
    };
    devices
        .find(|d| d.name().is_ok_and(|n| n == name))
        .ok_or_else(|| format!("device not found: {name}"))
}

/// Run `build` on a new thread and keep its stream alive until the returned
/// sender is dropped.
fn spawn_stream_thread<T, F>(
    name: &str,
    build: F,
) -> std::result::Result<(T, std_mpsc::Sender<()>), String>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<(Stream, T), String> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok((stream, info)) => {
                    let _ = ready_tx.send(Ok(info));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            // blocks until the owning handle is dropped
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| e.to_string())?;
    let info = ready_rx
        .recv()
        .map_err(|_| "audio thread exited".to_string())??;
    Ok((info, stop_tx))
}

/// Default (or named) system microphone.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    #[must_use]
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioInput for CpalInput {
    #[allow(clippy::result_large_err)]
    fn open(&mut self, config: &CaptureConfig) -> Result<CaptureStream> {
        if config.echo_cancellation || config.noise_suppression {
            tracing::debug!("Echo cancellation and noise suppression are not available through cpal");
        }
        let (block_tx, block_rx) = mpsc::channel::<Vec<f32>>(CAPTURE_QUEUE_BLOCKS);
        let device_name = self.device_name.clone();

        let ((sample_rate, channels), stop) = spawn_stream_thread("voice-capture", move || {
            let device = find_device(device_name.as_deref(), true)?;
            let default = device.default_input_config().map_err(|e| e.to_string())?;
            let stream_config = StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            tracing::info!(device = ?device.name().ok(), config = ?stream_config, "Opening microphone");
            let stream = device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if block_tx.try_send(data.to_vec()).is_err() {
                            tracing::trace!("Capture queue full, dropping block");
                        }
                    },
                    |err| tracing::error!(error = %err, "Microphone stream error"),
                    None,
                )
                .map_err(|e| e.to_string())?;
            stream.play().map_err(|e| e.to_string())?;
            Ok((stream, (stream_config.sample_rate.0, stream_config.channels)))
        })
        .map_err(Error::Microphone)?;

        Ok(CaptureStream::new(sample_rate, channels, block_rx).holding(stop))
    }
}

/// Seconds of device audio the playback ring can hold.
const OUTPUT_BUFFER_SECONDS: usize = 30;
/// Source frames per resampler chunk; small so a turn's tail is not held back.
const OUTPUT_RESAMPLER_CHUNK_FRAMES: usize = 64;

/// Default (or named) system speaker. Time is counted in frames played.
///
/// Samples reach the device callback through a lock-free ring; the callback
/// plays silence whenever the ring is empty.
pub struct CpalOutput {
    producer: HeapProd<f32>,
    played_frames: Arc<AtomicU64>,
    /// Device frames written to the ring since the stream opened.
    written_frames: u64,
    /// Samples the callback should drop before playing anything else.
    discard: Arc<AtomicUsize>,
    resampler: pcm::Resampler,
    device_rate: u32,
    _stop: std_mpsc::Sender<()>,
}

impl CpalOutput {
    /// Open the output device. `source_rate` is the rate of scheduled samples.
    ///
    /// # Errors
    /// Returns [`Error::AudioOutput`] if the device cannot be opened.
    #[allow(clippy::result_large_err)]
    pub fn open(device_name: Option<&str>, source_rate: u32) -> Result<Self> {
        let played_frames = Arc::new(AtomicU64::new(0));
        let discard = Arc::new(AtomicUsize::new(0));
        let played = Arc::clone(&played_frames);
        let pending_discard = Arc::clone(&discard);
        let device_name = device_name.map(str::to_string);

        let ((device_rate, producer), stop) = spawn_stream_thread("voice-playback", move || {
            let device = find_device(device_name.as_deref(), false)?;
            let default = device.default_output_config().map_err(|e| e.to_string())?;
            let stream_config = StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            let channels = usize::from(stream_config.channels.max(1));
            let capacity = stream_config.sample_rate.0 as usize * OUTPUT_BUFFER_SECONDS;
            let (producer, mut consumer) = HeapRb::<f32>::new(capacity).split();
            tracing::info!(device = ?device.name().ok(), config = ?stream_config, "Opening speaker");
            let stream = device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let dropped = pending_discard.swap(0, Ordering::AcqRel);
                        if dropped > 0 {
                            consumer.skip(dropped.min(consumer.occupied_len()));
                        }
                        let mut frames = 0u64;
                        for frame in data.chunks_mut(channels) {
                            frame.fill(consumer.try_pop().unwrap_or(0.0));
                            frames += 1;
                        }
                        played.fetch_add(frames, Ordering::Release);
                    },
                    |err| tracing::error!(error = %err, "Speaker stream error"),
                    None,
                )
                .map_err(|e| e.to_string())?;
            stream.play().map_err(|e| e.to_string())?;
            Ok((stream, (stream_config.sample_rate.0, producer)))
        })
        .map_err(Error::AudioOutput)?;

        let resampler = pcm::Resampler::new(source_rate, device_rate, OUTPUT_RESAMPLER_CHUNK_FRAMES)
            .map_err(|err| Error::AudioOutput(err.to_string()))?;

        Ok(Self {
            producer,
            played_frames,
            written_frames: 0,
            discard,
            resampler,
            device_rate,
            _stop: stop,
        })
    }

    fn write(&mut self, samples: &[f32]) {
        let pushed = self.producer.push_slice(samples);
        self.written_frames += pushed as u64;
        if pushed < samples.len() {
            tracing::warn!(dropped = samples.len() - pushed, "Playback buffer full, dropping samples");
        }
    }
}

impl AudioOutput for CpalOutput {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.played_frames.load(Ordering::Acquire) as f64 / f64::from(self.device_rate.max(1))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn schedule(&mut self, samples: &[f32], start_at: f64) -> Result<()> {
        let start_frame = (start_at.max(0.0) * f64::from(self.device_rate)).round() as u64;
        // the callback plays silence once the ring runs dry
        let queued_end = self.written_frames.max(self.played_frames.load(Ordering::Acquire));
        self.written_frames = queued_end;
        if start_frame > queued_end {
            let tail = self.resampler.flush()?;
            self.write(&tail);
            let gap = usize::try_from(start_frame.saturating_sub(self.written_frames)).unwrap_or(0);
            self.write(&vec![0.0; gap]);
        }
        let converted = self.resampler.process(samples)?;
        self.write(&converted);
        Ok(())
    }

    fn clear(&mut self) {
        self.discard.fetch_max(self.producer.occupied_len(), Ordering::AcqRel);
        self.resampler.reset();
        self.written_frames = self.played_frames.load(Ordering::Acquire);
    }
}
