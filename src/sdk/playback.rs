//! Gapless playback of streamed model audio.
//!
//! Fragments are queued until a small threshold is reached (or the response
//! finishes), then scheduled back to back on the output clock: the first
//! fragment of a turn starts `buffer_delay` in the future, every later one at
//! `max(now, next_start)`. A turn lasts until [`AudioPlayback::end_turn`], so
//! an underrun in the middle of a response does not re-buffer.

use crate::Result;
use crate::protocol::models::PCM16_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::pcm;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Fragments buffered before the first one of a turn is scheduled.
    pub start_threshold: usize,
    pub buffer_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PCM16_SAMPLE_RATE,
            start_threshold: 3,
            buffer_delay_ms: 50,
        }
    }
}

/// A speaker backend with its own monotonic clock, in seconds.
pub trait AudioOutput: Send {
    fn now(&self) -> f64;

    /// Play `samples` (mono, at the configured rate) starting at `start_at`.
    ///
    /// # Errors
    /// Returns an error if the device rejected the buffer.
    #[allow(clippy::result_large_err)]
    fn schedule(&mut self, samples: &[f32], start_at: f64) -> Result<()>;

    /// Drop everything scheduled but not yet played.
    fn clear(&mut self);
}

/// Output that discards audio but keeps time, for headless hosts.
#[derive(Debug, Clone, Copy)]
pub struct NullOutput {
    origin: tokio::time::Instant,
}

impl Default for NullOutput {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl AudioOutput for NullOutput {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, _samples: &[f32], _start_at: f64) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) {}
}

/// Start-time bookkeeping for one speaking turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackScheduler {
    buffer_delay: f64,
    next_start: f64,
    started: bool,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(buffer_delay: Duration) -> Self {
        Self {
            buffer_delay: buffer_delay.as_secs_f64(),
            next_start: 0.0,
            started: false,
        }
    }

    /// Start time for a fragment of `duration` seconds scheduled at `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = if self.started {
            now.max(self.next_start)
        } else {
            self.started = true;
            now + self.buffer_delay
        };
        self.next_start = start + duration;
        start
    }

    /// When the last scheduled fragment ends.
    #[must_use]
    pub const fn end_time(&self) -> f64 {
        self.next_start
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    pub const fn reset(&mut self) {
        self.next_start = 0.0;
        self.started = false;
    }
}

pub struct AudioPlayback {
    output: Box<dyn AudioOutput>,
    config: PlaybackConfig,
    queue: VecDeque<Vec<f32>>,
    scheduler: PlaybackScheduler,
    /// Something is scheduled and has not finished sounding.
    active: bool,
    turn_open: bool,
}

impl AudioPlayback {
    #[must_use]
    pub fn new(output: Box<dyn AudioOutput>, config: PlaybackConfig) -> Self {
        let scheduler = PlaybackScheduler::new(Duration::from_millis(config.buffer_delay_ms));
        Self {
            output,
            config,
            queue: VecDeque::new(),
            scheduler,
            active: false,
            turn_open: false,
        }
    }

    /// True from the first fragment of a turn until the turn has ended and its
    /// last fragment has played.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active || self.turn_open
    }

    /// Queue a base64 PCM16 fragment.
    ///
    /// # Errors
    /// Returns an error if the fragment is not valid base64 or the device
    /// rejects it. A bad fragment is dropped; playback continues.
    #[allow(clippy::result_large_err)]
    pub fn push_delta(&mut self, delta: &str) -> Result<()> {
        let samples = pcm::decode_pcm16(delta)?;
        if samples.is_empty() {
            return Ok(());
        }
        self.active = true;
        self.turn_open = true;
        self.queue.push_back(samples);
        if self.scheduler.is_started() || self.queue.len() >= self.config.start_threshold {
            self.drain()?;
        }
        Ok(())
    }

    /// The response finished streaming audio: schedule whatever is buffered
    /// and let the next fragment start a new turn.
    ///
    /// # Errors
    /// Returns an error if the device rejects a fragment.
    #[allow(clippy::result_large_err)]
    pub fn end_turn(&mut self) -> Result<()> {
        self.turn_open = false;
        self.drain()?;
        if !self.active {
            self.scheduler.reset();
        }
        Ok(())
    }

    #[allow(clippy::result_large_err, clippy::cast_precision_loss)]
    fn drain(&mut self) -> Result<()> {
        let rate = f64::from(self.config.sample_rate.max(1));
        while let Some(samples) = self.queue.pop_front() {
            let duration = samples.len() as f64 / rate;
            let start = self.scheduler.schedule(self.output.now(), duration);
            self.output.schedule(&samples, start)?;
        }
        Ok(())
    }

    /// Time until the last scheduled fragment has played, when nothing is
    /// waiting in the queue.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        if !self.active || !self.queue.is_empty() || !self.scheduler.is_started() {
            return None;
        }
        let left = (self.scheduler.end_time() - self.output.now()).max(0.0);
        Some(Duration::from_secs_f64(left))
    }

    /// Mark the speaker silent once the queue is empty and the clock has
    /// passed the end of the last fragment. Returns true on that transition.
    /// Inside an open turn this is an underrun and the schedule is kept.
    pub fn poll_idle(&mut self) -> bool {
        if self.active
            && self.queue.is_empty()
            && self.output.now() >= self.scheduler.end_time()
        {
            self.active = false;
            if self.turn_open {
                tracing::debug!("Playback underrun");
            } else {
                self.scheduler.reset();
                tracing::debug!("Playback finished");
            }
            return true;
        }
        false
    }

    /// Silence the speaker and drop queued audio.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.output.clear();
        self.scheduler.reset();
        self.active = false;
        self.turn_open = false;
    }
}
