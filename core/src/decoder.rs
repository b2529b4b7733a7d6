use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::detector::{DecoderState, DecoderStats, FrameTracker};
use crate::error::{Result, SoundPayError};
use crate::spectrum::SpectrumAnalyzer;
use crate::token::Token;
use crate::{
    DUPLICATE_COOLDOWN_MS, FFT_SIZE, FRAME_TIMEOUT_MS, HOP_SIZE, MIN_CHAR_INTERVAL_MS,
    MIN_FRAME_CHARS, NOISE_THRESHOLD, SAMPLE_RATE, SILENCE_RESET_MS, SYMBOL_TOLERANCE,
    SYNC_TOLERANCE,
};

/// Longest analysis window that still fits inside the shortest inter-symbol gap
const MAX_WINDOW_SECS: f32 = 0.047;

/// Receiver tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Samples between successive analyses
    pub hop_size: usize,
    /// Peaks below this amplitude count as silence
    pub noise_threshold: f32,
    pub sync_tolerance_hz: f32,
    pub symbol_tolerance_hz: f32,
    /// Same character is accepted again only after this long
    pub min_char_interval_ms: u64,
    /// Silence this long forgets the previous character
    pub silence_reset_ms: u64,
    /// An open frame with no progress for this long is dropped
    pub frame_timeout_ms: u64,
    /// Identical tokens within this window are reported once
    pub duplicate_cooldown_ms: u64,
    /// Characters required before a sync may close a frame
    pub min_frame_chars: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE as u32,
            fft_size: FFT_SIZE,
            hop_size: HOP_SIZE,
            noise_threshold: NOISE_THRESHOLD,
            sync_tolerance_hz: SYNC_TOLERANCE,
            symbol_tolerance_hz: SYMBOL_TOLERANCE,
            min_char_interval_ms: MIN_CHAR_INTERVAL_MS,
            silence_reset_ms: SILENCE_RESET_MS,
            frame_timeout_ms: FRAME_TIMEOUT_MS,
            duplicate_cooldown_ms: DUPLICATE_COOLDOWN_MS,
            min_frame_chars: MIN_FRAME_CHARS,
        }
    }
}

impl DecoderConfig {
    /// Defaults with the transform sized for a capture device's sample rate.
    ///
    /// Picks the largest power-of-two window no longer than ~47 ms so that
    /// a window fits between two tones, with a quarter-window hop.
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        let max_window = (sample_rate as f32 * MAX_WINDOW_SECS) as usize;
        let mut fft_size = 16;
        while fft_size * 2 <= max_window {
            fft_size *= 2;
        }
        Self {
            sample_rate,
            fft_size,
            hop_size: fft_size / 4,
            ..Self::default()
        }
    }

    /// Keep every tuning knob but resize the transform for `sample_rate`
    pub fn resized_for(self, sample_rate: u32) -> Self {
        if sample_rate == self.sample_rate {
            return self;
        }
        let sized = Self::for_sample_rate(sample_rate);
        Self {
            sample_rate: sized.sample_rate,
            fft_size: sized.fft_size,
            hop_size: sized.hop_size,
            ..self
        }
    }

    pub fn min_char_interval(&self) -> Duration {
        Duration::from_millis(self.min_char_interval_ms)
    }

    pub fn silence_reset(&self) -> Duration {
        Duration::from_millis(self.silence_reset_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn duplicate_cooldown(&self) -> Duration {
        Duration::from_millis(self.duplicate_cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hop_size == 0 || self.hop_size > self.fft_size {
            return Err(SoundPayError::InvalidConfig(format!(
                "hop size {} must be between 1 and the FFT size {}",
                self.hop_size, self.fft_size
            )));
        }
        if self.min_frame_chars == 0 {
            return Err(SoundPayError::InvalidConfig("min_frame_chars must be at least 1".into()));
        }
        Ok(())
    }
}

/// Streaming decoder: audio samples in, tokens out
///
/// Keeps the most recent `fft_size` samples and analyses them every
/// `hop_size` new samples. The sample count is the clock, so feeding the
/// same audio always produces the same tokens regardless of wall time.
pub struct SpectralDecoder {
    config: DecoderConfig,
    analyzer: SpectrumAnalyzer,
    tracker: FrameTracker,
    window: Vec<f32>,
    filled: usize,
    since_analysis: usize,
    samples_seen: u64,
}

impl SpectralDecoder {
    pub fn new(config: DecoderConfig) -> Result<Self> {
        config.validate()?;
        let analyzer = SpectrumAnalyzer::new(config.sample_rate, config.fft_size, config.noise_threshold)?;
        Ok(Self {
            analyzer,
            tracker: FrameTracker::new(config.clone()),
            window: vec![0.0; config.fft_size],
            filled: 0,
            since_analysis: 0,
            samples_seen: 0,
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn state(&self) -> DecoderState {
        self.tracker.state()
    }

    pub fn collected(&self) -> &str {
        self.tracker.collected()
    }

    pub fn stats(&self) -> DecoderStats {
        self.tracker.stats()
    }

    /// Position of the stream clock
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.samples_seen * 1_000_000_000 / self.config.sample_rate as u64)
    }

    /// Forget everything, as at the start of a new listening session
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.window.iter_mut().for_each(|s| *s = 0.0);
        self.filled = 0;
        self.since_analysis = 0;
        self.samples_seen = 0;
    }

    /// Feed captured audio; returns every token completed inside this block
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<Vec<Token>> {
        let fft_size = self.config.fft_size;
        let mut tokens = Vec::new();

        for &sample in samples {
            // Sliding window: shift left by one hop at a time rather than per sample
            if self.filled == fft_size {
                let hop = self.config.hop_size;
                self.window.copy_within(hop.., 0);
                self.filled -= hop;
            }
            self.window[self.filled] = sample;
            self.filled += 1;
            self.samples_seen += 1;
            self.since_analysis += 1;

            if self.filled == fft_size && self.since_analysis >= self.config.hop_size {
                self.since_analysis = 0;
                if let Some(token) = self.analyze()? {
                    tokens.push(token);
                }
            }
        }

        Ok(tokens)
    }

    /// Feed one already-aligned analysis frame, as delivered by a platform
    /// analyser node. `now` is the caller's clock.
    pub fn push_frame(&mut self, frame: &[f32], now: Duration) -> Result<Option<Token>> {
        let frequency = self.analyzer.dominant(frame)?.map(|d| d.frequency);
        Ok(self.tracker.observe(frequency, now))
    }

    fn analyze(&mut self) -> Result<Option<Token>> {
        let now = self.elapsed();
        let detection = self.analyzer.dominant(&self.window)?;
        if let Some(d) = detection {
            debug!("{:?}: peak {:.1} Hz at {:.3}", now, d.frequency, d.magnitude);
        }
        Ok(self.tracker.observe(detection.map(|d| d.frequency), now))
    }
}
