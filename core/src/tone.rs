use std::f32::consts::PI;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EncodingError;
use crate::symbols::char_to_frequency;
use crate::token::Token;
use crate::{ENVELOPE_RAMP_MS, LEAD_IN_MS, SYNC_DURATION_FACTOR, SYNC_FREQUENCY};

/// Loudness and pacing for one broadcast attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttemptProfile {
    /// Peak amplitude, 0.0 - 1.0
    pub volume: f32,
    /// How long each symbol tone is held
    pub tone_ms: u64,
    /// Silence after each symbol tone
    pub silence_ms: u64,
    /// How long to poll the backend after this attempt's broadcast
    pub poll_window_ms: u64,
}

impl AttemptProfile {
    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_ms)
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn poll_window(&self) -> Duration {
        Duration::from_millis(self.poll_window_ms)
    }

    /// Sync tones are held longer than symbol tones so they stand apart
    pub fn sync_duration(&self) -> Duration {
        self.tone_duration() * SYNC_DURATION_FACTOR
    }

    /// Default escalation ladder: quiet and short first, loud and long last.
    /// The last attempt gets a longer poll window for late confirmations.
    pub fn default_ladder() -> Vec<AttemptProfile> {
        vec![
            AttemptProfile { volume: 0.35, tone_ms: 150, silence_ms: 80, poll_window_ms: 8_000 },
            AttemptProfile { volume: 0.65, tone_ms: 200, silence_ms: 100, poll_window_ms: 8_000 },
            AttemptProfile { volume: 1.0, tone_ms: 250, silence_ms: 120, poll_window_ms: 11_000 },
        ]
    }
}

impl Default for AttemptProfile {
    fn default() -> Self {
        AttemptProfile::default_ladder()[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    Sync,
    Symbol(char),
}

/// One oscillator burst on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledTone {
    pub kind: ToneKind,
    pub frequency: f32,
    /// Offset from the start of the broadcast
    pub start: Duration,
    pub duration: Duration,
    pub volume: f32,
}

impl ScheduledTone {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Complete timeline for one frame: sync, symbols, sync
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSchedule {
    tones: Vec<ScheduledTone>,
    total_duration: Duration,
}

impl ToneSchedule {
    pub fn tones(&self) -> &[ScheduledTone] {
        &self.tones
    }

    /// Wall-clock length of the broadcast, including lead-in and trailing silence
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn frequencies(&self) -> Vec<f32> {
        self.tones.iter().map(|tone| tone.frequency).collect()
    }

    /// Render the timeline to mono PCM at `sample_rate`
    ///
    /// Each tone gets a linear attack/release so tone edges do not click.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let sr = sample_rate as f32;
        let total_samples = duration_to_samples(self.total_duration, sr);
        let mut samples = vec![0.0f32; total_samples];
        let ramp_samples = duration_to_samples(Duration::from_millis(ENVELOPE_RAMP_MS), sr);

        for tone in &self.tones {
            let start = duration_to_samples(tone.start, sr);
            let len = duration_to_samples(tone.duration, sr).min(total_samples.saturating_sub(start));
            let ramp = ramp_samples.min(len / 2);

            for i in 0..len {
                let t = i as f32 / sr;
                let envelope = linear_envelope(i, len, ramp);
                samples[start + i] = (2.0 * PI * tone.frequency * t).sin() * tone.volume * envelope;
            }
        }

        samples
    }
}

fn duration_to_samples(duration: Duration, sample_rate: f32) -> usize {
    (duration.as_secs_f32() * sample_rate).round() as usize
}

/// Linear ramp up, hold, linear ramp down
fn linear_envelope(i: usize, len: usize, ramp: usize) -> f32 {
    if ramp == 0 {
        return 1.0;
    }
    if i < ramp {
        i as f32 / ramp as f32
    } else if i >= len - ramp {
        (len - 1 - i) as f32 / ramp as f32
    } else {
        1.0
    }
}

/// Turns tokens into tone timelines
///
/// Frame layout:
/// lead-in → sync → 2×silence → (symbol → silence)* → silence → sync → silence
pub struct ToneEncoder {
    sample_rate: u32,
}

impl ToneEncoder {
    pub fn new() -> Self {
        Self::with_sample_rate(crate::SAMPLE_RATE as u32)
    }

    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Validate a raw token and build its timeline
    ///
    /// Fails before anything is scheduled if any character is outside the alphabet.
    pub fn schedule(&self, raw: &str, profile: &AttemptProfile) -> Result<ToneSchedule, EncodingError> {
        let token = Token::parse(raw)?;
        Ok(self.schedule_token(&token, profile))
    }

    pub fn schedule_token(&self, token: &Token, profile: &AttemptProfile) -> ToneSchedule {
        let tone = profile.tone_duration();
        let silence = profile.silence_duration();
        let sync = profile.sync_duration();

        let mut tones = Vec::with_capacity(token.len() + 2);
        let mut cursor = Duration::from_millis(LEAD_IN_MS);

        tones.push(ScheduledTone {
            kind: ToneKind::Sync,
            frequency: SYNC_FREQUENCY,
            start: cursor,
            duration: sync,
            volume: profile.volume,
        });
        cursor += sync + silence * 2;

        for c in token.as_str().chars() {
            // Token::parse already rejected characters without a frequency
            let Some(frequency) = char_to_frequency(c) else { continue };
            tones.push(ScheduledTone {
                kind: ToneKind::Symbol(c),
                frequency,
                start: cursor,
                duration: tone,
                volume: profile.volume,
            });
            cursor += tone + silence;
        }

        // One more gap so the closing sync mirrors the opening double silence
        cursor += silence;
        tones.push(ScheduledTone {
            kind: ToneKind::Sync,
            frequency: SYNC_FREQUENCY,
            start: cursor,
            duration: sync,
            volume: profile.volume,
        });
        cursor += sync + silence;

        ToneSchedule { tones, total_duration: cursor }
    }

    /// Validate, schedule and render in one step
    pub fn encode(&self, raw: &str, profile: &AttemptProfile) -> Result<Vec<f32>, EncodingError> {
        Ok(self.schedule(raw, profile)?.render(self.sample_rate))
    }
}

impl Default for ToneEncoder {
    fn default() -> Self {
        Self::new()
    }
}
