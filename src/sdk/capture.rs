//! Microphone capture: resample to the session rate, frame, gate and encode.

use crate::{Error, Result};
use crate::protocol::models::PCM16_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::pcm;

/// 100 ms at 24 kHz.
pub const DEFAULT_FRAME_SAMPLES: usize = 2_400;
/// Device frames per resampler chunk.
const RESAMPLER_CHUNK_FRAMES: usize = 480;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_sample_rate: u32,
    /// Samples per transmitted frame, at `target_sample_rate`.
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: PCM16_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// An acquired microphone stream. Dropping it releases the device.
pub struct CaptureStream {
    pub sample_rate: u32,
    pub channels: u16,
    blocks: mpsc::Receiver<Vec<f32>>,
    _device: Option<Box<dyn Send>>,
}

impl CaptureStream {
    /// `blocks` yields interleaved float samples at `sample_rate`.
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, blocks: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
            blocks,
            _device: None,
        }
    }

    /// Keep `device` alive for as long as the stream is open.
    #[must_use]
    pub fn holding(mut self, device: impl Send + 'static) -> Self {
        self._device = Some(Box::new(device));
        self
    }
}

impl std::fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

/// A microphone backend.
pub trait AudioInput: Send {
    /// Acquire the device. Fails if permission is denied or no device exists.
    ///
    /// # Errors
    /// Returns an error if the device cannot be opened.
    #[allow(clippy::result_large_err)]
    fn open(&mut self, config: &CaptureConfig) -> Result<CaptureStream>;
}

/// Whether captured audio may leave the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureGate {
    pub connected: bool,
    pub playback_active: bool,
    pub muted: bool,
}

impl CaptureGate {
    /// Audio is sent only while connected, not muted, and the model is not
    /// speaking. The last condition keeps the model from hearing itself.
    #[must_use]
    pub const fn is_open(self) -> bool {
        self.connected && !self.playback_active && !self.muted
    }
}

pub struct AudioCapture {
    input: Box<dyn AudioInput>,
    config: CaptureConfig,
    stream: Option<CaptureStream>,
    resampler: Option<pcm::Resampler>,
    pending: Vec<f32>,
}

impl AudioCapture {
    #[must_use]
    pub fn new(input: Box<dyn AudioInput>, config: CaptureConfig) -> Self {
        Self {
            input,
            config,
            stream: None,
            resampler: None,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Acquire the microphone. Idempotent.
    ///
    /// # Errors
    /// Returns [`Error::Microphone`] if the device cannot be opened.
    #[allow(clippy::result_large_err)]
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.input.open(&self.config).map_err(|err| match err {
            Error::Microphone(_) => err,
            other => Error::Microphone(other.to_string()),
        })?;
        let resampler = pcm::Resampler::new(
            stream.sample_rate,
            self.config.target_sample_rate,
            RESAMPLER_CHUNK_FRAMES,
        )
        .map_err(|err| Error::Microphone(err.to_string()))?;
        tracing::info!(
            sample_rate = stream.sample_rate,
            channels = stream.channels,
            "Microphone capture started"
        );
        self.stream = Some(stream);
        self.resampler = Some(resampler);
        Ok(())
    }

    /// Release the microphone and drop any partial frame.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Microphone capture stopped");
        }
        self.resampler = None;
        self.pending.clear();
    }

    /// Next raw block from the device. Pends forever while stopped; yields
    /// `None` if the device went away.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        match self.stream.as_mut() {
            Some(stream) => stream.blocks.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Convert a raw block and return the base64 frames to transmit. Complete
    /// frames formed while the gate is closed are discarded.
    pub fn process(&mut self, block: &[f32], gate: CaptureGate) -> Vec<String> {
        let (Some(stream), Some(resampler)) = (self.stream.as_ref(), self.resampler.as_mut()) else {
            return Vec::new();
        };
        let mono = pcm::downmix(block, stream.channels);
        match resampler.process(&mono) {
            Ok(resampled) => self.pending.extend_from_slice(&resampled),
            Err(err) => {
                tracing::warn!(error = %err, "Dropping microphone block that failed to resample");
                return Vec::new();
            }
        }

        let frame_samples = self.config.frame_samples.max(1);
        let mut frames = Vec::new();
        while self.pending.len() >= frame_samples {
            let frame: Vec<f32> = self.pending.drain(..frame_samples).collect();
            if gate.is_open() {
                frames.push(pcm::encode_pcm16(&pcm::f32_to_pcm16(&frame)));
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeMic {
        rate: u32,
        channels: u16,
        blocks: Option<mpsc::Receiver<Vec<f32>>>,
    }

    impl AudioInput for FakeMic {
        fn open(&mut self, _config: &CaptureConfig) -> Result<CaptureStream> {
            let blocks = self
                .blocks
                .take()
                .ok_or_else(|| Error::Microphone("Permission denied".into()))?;
            Ok(CaptureStream::new(self.rate, self.channels, blocks))
        }
    }

    fn capture(rate: u32, channels: u16, frame_samples: usize) -> (AudioCapture, mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = mpsc::channel(8);
        let mic = FakeMic { rate, channels, blocks: Some(rx) };
        let config = CaptureConfig { frame_samples, ..CaptureConfig::default() };
        (AudioCapture::new(Box::new(mic), config), tx)
    }

    const OPEN: CaptureGate = CaptureGate { connected: true, playback_active: false, muted: false };

    #[test]
    fn gate_requires_all_conditions() {
        assert!(OPEN.is_open());
        assert!(!CaptureGate { muted: true, ..OPEN }.is_open());
        assert!(!CaptureGate { playback_active: true, ..OPEN }.is_open());
        assert!(!CaptureGate { connected: false, ..OPEN }.is_open());
    }

    #[test]
    fn frames_are_fixed_size() {
        let (mut capture, _tx) = capture(24_000, 1, 4);
        capture.start().unwrap();
        assert!(capture.process(&[0.0; 3], OPEN).is_empty());
        let frames = capture.process(&[0.0; 6], OPEN);
        assert_eq!(frames.len(), 2);
        // 4 samples -> 8 bytes -> 12 base64 chars
        assert!(frames.iter().all(|f| f.len() == 12));
    }

    #[test]
    fn gated_frames_are_dropped_not_buffered() {
        let (mut capture, _tx) = capture(24_000, 1, 4);
        capture.start().unwrap();
        let muted = CaptureGate { muted: true, ..OPEN };
        assert!(capture.process(&[0.1; 8], muted).is_empty());
        assert!(capture.process(&[0.1; 2], OPEN).is_empty());
        assert_eq!(capture.process(&[0.1; 2], OPEN).len(), 1);
    }

    #[test]
    fn stereo_48k_is_converted() {
        let (mut capture, _tx) = capture(48_000, 2, 240);
        capture.start().unwrap();
        // 100 ms of stereo at 48k in 10 ms blocks
        let block: Vec<f32> = [0.5_f32, 0.5].repeat(480);
        let mut frames = Vec::new();
        for _ in 0..10 {
            frames.extend(capture.process(&block, OPEN));
        }
        // about 2400 samples at 24k, minus the held resampler tail
        assert!((8..=10).contains(&frames.len()), "{} frames", frames.len());
        let last = pcm::decode_pcm16(frames.last().unwrap()).unwrap();
        assert_eq!(last.len(), 240);
        assert!(last.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn resampler_state_carries_across_blocks() {
        let (mut capture, _tx) = capture(44_100, 1, 2_400);
        capture.start().unwrap();
        let mut sent = 0;
        for _ in 0..(10 * 44_100 / 512) {
            sent += capture.process(&[0.0; 512], OPEN).len();
        }
        // 10 s at 24k is 100 frames; none are lost or invented at block edges
        assert_eq!(sent, 99);
    }

    #[test]
    fn open_failure_is_a_microphone_error() {
        let mut capture = AudioCapture::new(
            Box::new(FakeMic { rate: 24_000, channels: 1, blocks: None }),
            CaptureConfig::default(),
        );
        assert!(matches!(capture.start(), Err(Error::Microphone(_))));
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn stop_releases_stream() {
        let (mut capture, tx) = capture(24_000, 1, 4);
        capture.start().unwrap();
        tx.send(vec![0.5; 4]).await.unwrap();
        assert_eq!(capture.next_block().await, Some(vec![0.5; 4]));
        capture.stop();
        assert!(!capture.is_running());
        assert!(tx.is_closed());
    }
}
