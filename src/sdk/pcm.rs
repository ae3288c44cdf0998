//! PCM16 sample conversion shared by capture and playback.

use crate::Result;
use base64::Engine as _;
use base64::engine::general_purpose;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

/// Convert float samples to PCM16, clamping to `[-1, 1]` first.
/// Negative values scale by 32768, positive by 32767.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let s = sample.clamp(-1.0, 1.0);
            if s < 0.0 { (s * 32_768.0) as i16 } else { (s * 32_767.0) as i16 }
        })
        .collect()
}

#[must_use]
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32_768.0).collect()
}

/// Base64 of the little-endian byte stream.
#[must_use]
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    general_purpose::STANDARD.encode(buf)
}

/// Decode a base64 PCM16 fragment into float samples. A trailing odd byte is ignored.
///
/// # Errors
/// Returns an error if `fragment` is not valid base64.
#[allow(clippy::result_large_err)]
pub fn decode_pcm16(fragment: &str) -> Result<Vec<f32>> {
    let bytes = general_purpose::STANDARD.decode(fragment.as_bytes())?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
        .collect())
}

/// Average interleaved multichannel frames down to mono.
#[must_use]
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = usize::from(channels);
    interleaved
        .chunks_exact(n)
        .map(|frame| frame.iter().sum::<f32>() / f32::from(channels))
        .collect()
}

/// Streaming mono sample rate converter.
///
/// Input short of a full chunk is held until the next call and the filter
/// state carries over, so block boundaries are seamless and the output rate
/// does not drift. Equal rates pass samples through untouched.
pub struct Resampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl Resampler {
    /// Convert from `from_rate` to `to_rate`, `chunk_frames` input samples
    /// at a time.
    ///
    /// # Errors
    /// Returns an error if the rate ratio is not usable (e.g. a zero rate).
    #[allow(clippy::result_large_err)]
    pub fn new(from_rate: u32, to_rate: u32, chunk_frames: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self { inner: None, pending: Vec::new() });
        }
        // a zero rate yields ratio 0, which rubato rejects
        let ratio = if from_rate == 0 {
            0.0
        } else {
            f64::from(to_rate) / f64::from(from_rate)
        };
        let inner = FastFixedIn::<f32>::new(
            ratio,
            1.0,
            PolynomialDegree::Linear,
            chunk_frames.max(1),
            1,
        )?;
        Ok(Self { inner: Some(inner), pending: Vec::new() })
    }

    /// Input samples waiting for a full chunk.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Convert `input`, returning every output sample that is ready.
    ///
    /// # Errors
    /// Returns an error if the resampler rejects a chunk.
    #[allow(clippy::result_large_err)]
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };
        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = inner.input_frames_next();
            let Some(chunk) = self.pending.get(consumed..consumed + needed) else {
                break;
            };
            if let Some(channel) = inner.process(&[chunk], None)?.first() {
                out.extend_from_slice(channel);
            }
            consumed += needed;
        }
        self.pending.drain(..consumed);
        Ok(out)
    }

    /// Pad the held input with silence and convert it.
    ///
    /// # Errors
    /// Returns an error if the resampler rejects the chunk.
    #[allow(clippy::result_large_err)]
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_ref() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let padded = inner.input_frames_next().max(self.pending.len());
        let mut tail = std::mem::take(&mut self.pending);
        tail.resize(padded, 0.0);
        self.process(&tail)
    }

    /// Drop held input and filter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("passthrough", &self.inner.is_none())
            .field("buffered", &self.pending.len())
            .finish()
    }
}
