use std::time::Duration;

use log::{debug, info, warn};

use crate::decoder::DecoderConfig;
use crate::symbols::{frequency_to_char_within, is_sync};
use crate::token::Token;
use crate::MAX_TOKEN_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Waiting for an opening sync tone
    Idle,
    /// Sync seen, collecting symbol characters
    InFrame,
}

/// Counters kept across one listening session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub analysis_frames: u64,
    pub detections: u64,
    pub frames_opened: u64,
    pub frames_closed: u64,
    pub frames_rejected: u64,
    pub frames_timed_out: u64,
    pub duplicates_suppressed: u64,
    pub tokens_emitted: u64,
}

/// Framing state machine fed one observation per analysis frame
///
/// Times are offsets on the caller's clock; the tracker never reads a clock
/// itself, so the same input always yields the same tokens.
pub struct FrameTracker {
    config: DecoderConfig,
    state: DecoderState,
    collected: String,
    last_char: Option<char>,
    last_accept_at: Option<Duration>,
    last_detection_at: Option<Duration>,
    last_progress_at: Duration,
    // Set when a frame closes; cleared once the closing sync tone has ended
    sync_latched: bool,
    last_emitted: Option<(Token, Duration)>,
    stats: DecoderStats,
}

impl FrameTracker {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            state: DecoderState::Idle,
            collected: String::new(),
            last_char: None,
            last_accept_at: None,
            last_detection_at: None,
            last_progress_at: Duration::ZERO,
            sync_latched: false,
            last_emitted: None,
            stats: DecoderStats::default(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Characters accepted so far in the open frame
    pub fn collected(&self) -> &str {
        &self.collected
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop all per-session state, including duplicate-suppression memory
    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    /// Feed one analysis result. `frequency` is None for a silent frame.
    /// Returns a token when a frame closes on a valid, non-duplicate token.
    pub fn observe(&mut self, frequency: Option<f32>, now: Duration) -> Option<Token> {
        self.stats.analysis_frames += 1;

        if self.state == DecoderState::InFrame
            && now.saturating_sub(self.last_progress_at) > self.config.frame_timeout()
        {
            warn!(
                "No terminal sync after {:?}, dropping partial frame {:?}",
                self.config.frame_timeout(),
                self.collected
            );
            self.stats.frames_timed_out += 1;
            self.abandon_frame();
        }

        let Some(freq) = frequency else {
            self.on_silence(now);
            return None;
        };

        self.stats.detections += 1;
        self.last_detection_at = Some(now);

        if is_sync(freq, self.config.sync_tolerance_hz) {
            return self.on_sync(now);
        }
        self.sync_latched = false;

        match frequency_to_char_within(freq, self.config.symbol_tolerance_hz) {
            Some(c) if self.state == DecoderState::InFrame => self.on_symbol(c, now),
            Some(_) => {}
            None => debug!("Ignoring off-grid tone at {:.1} Hz", freq),
        }
        None
    }

    fn on_silence(&mut self, now: Duration) {
        self.sync_latched = false;
        if let Some(last) = self.last_detection_at {
            if now.saturating_sub(last) >= self.config.silence_reset() {
                // The gap between two tones: the same character may legitimately repeat
                self.last_char = None;
            }
        }
    }

    fn on_sync(&mut self, now: Duration) -> Option<Token> {
        match self.state {
            DecoderState::Idle => {
                if self.sync_latched {
                    return None;
                }
                debug!("Sync detected, opening frame");
                self.state = DecoderState::InFrame;
                self.collected.clear();
                self.last_char = None;
                self.last_accept_at = None;
                self.last_progress_at = now;
                self.stats.frames_opened += 1;
                None
            }
            DecoderState::InFrame => {
                // The opening sync spans many analysis frames; only a sync
                // after enough characters can close the frame
                if self.collected.len() >= self.config.min_frame_chars {
                    self.close_frame(now)
                } else {
                    None
                }
            }
        }
    }

    fn on_symbol(&mut self, c: char, now: Duration) {
        let changed = self.last_char != Some(c);
        let interval_elapsed = self
            .last_accept_at
            .map_or(true, |at| now.saturating_sub(at) >= self.config.min_char_interval());

        if !(changed || interval_elapsed) {
            return;
        }

        self.collected.push(c);
        self.last_char = Some(c);
        self.last_accept_at = Some(now);
        self.last_progress_at = now;
        debug!("Accepted {:?}, frame so far {:?}", c, self.collected);

        if self.collected.len() > MAX_TOKEN_LEN {
            debug!("Frame exceeded {} characters, dropping", MAX_TOKEN_LEN);
            self.stats.frames_rejected += 1;
            self.abandon_frame();
        }
    }

    fn close_frame(&mut self, now: Duration) -> Option<Token> {
        let candidate = std::mem::take(&mut self.collected);
        self.state = DecoderState::Idle;
        self.last_char = None;
        self.last_accept_at = None;
        self.sync_latched = true;
        self.stats.frames_closed += 1;

        let token = match Token::parse(&candidate) {
            Ok(token) if token.has_payment_prefix() => token,
            _ => {
                debug!("Discarding frame {:?}: not a payment token", candidate);
                self.stats.frames_rejected += 1;
                return None;
            }
        };

        if let Some((previous, at)) = &self.last_emitted {
            if *previous == token && now.saturating_sub(*at) < self.config.duplicate_cooldown() {
                debug!("Suppressing repeat of {}", token);
                self.stats.duplicates_suppressed += 1;
                return None;
            }
        }

        info!("Received token {}", token);
        self.last_emitted = Some((token.clone(), now));
        self.stats.tokens_emitted += 1;
        Some(token)
    }

    fn abandon_frame(&mut self) {
        self.state = DecoderState::Idle;
        self.collected.clear();
        self.last_char = None;
        self.last_accept_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::char_to_frequency;
    use crate::SYNC_FREQUENCY;

    const HOP_MS: u64 = 10;

    /// Drives the tracker with a synthetic observation timeline
    struct Feed {
        tracker: FrameTracker,
        now: Duration,
        emitted: Vec<Token>,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                tracker: FrameTracker::new(DecoderConfig::default()),
                now: Duration::ZERO,
                emitted: Vec::new(),
            }
        }

        fn hold(&mut self, frequency: Option<f32>, ms: u64) {
            for _ in 0..(ms / HOP_MS) {
                self.now += Duration::from_millis(HOP_MS);
                if let Some(token) = self.tracker.observe(frequency, self.now) {
                    self.emitted.push(token);
                }
            }
        }

        fn frame(&mut self, token: &str) {
            self.hold(Some(SYNC_FREQUENCY), 300);
            self.hold(None, 160);
            for c in token.chars() {
                self.hold(char_to_frequency(c), 150);
                self.hold(None, 80);
            }
            self.hold(None, 80);
            self.hold(Some(SYNC_FREQUENCY), 300);
            self.hold(None, 80);
        }
    }

    #[test]
    fn test_full_frame_emits_token() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        assert_eq!(feed.emitted, vec![Token::parse("PAY_1A2B").unwrap()]);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
    }

    #[test]
    fn test_sustained_tone_counted_once() {
        let mut feed = Feed::new();
        feed.hold(Some(SYNC_FREQUENCY), 300);
        feed.hold(None, 160);
        feed.hold(char_to_frequency('P'), 250);
        assert_eq!(feed.tracker.collected(), "P");
    }

    #[test]
    fn test_repeated_characters_survive_debounce() {
        let mut feed = Feed::new();
        feed.frame("PAY_1100");
        assert_eq!(feed.emitted, vec![Token::parse("PAY_1100").unwrap()]);
    }

    #[test]
    fn test_repeat_without_gap_needs_interval() {
        let mut feed = Feed::new();
        feed.hold(Some(SYNC_FREQUENCY), 300);
        feed.hold(None, 160);
        // No silence between: the second '1' only counts once the interval elapses
        feed.hold(char_to_frequency('1'), 200);
        assert_eq!(feed.tracker.collected(), "1");
        feed.hold(char_to_frequency('1'), 200);
        assert_eq!(feed.tracker.collected(), "11");
    }

    #[test]
    fn test_silence_never_leaves_idle() {
        let mut feed = Feed::new();
        feed.hold(None, 5_000);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
        assert_eq!(feed.tracker.stats().detections, 0);
    }

    #[test]
    fn test_symbols_ignored_while_idle() {
        let mut feed = Feed::new();
        feed.hold(char_to_frequency('A'), 150);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
        assert_eq!(feed.tracker.collected(), "");
    }

    #[test]
    fn test_off_grid_tone_ignored() {
        let mut feed = Feed::new();
        feed.hold(Some(SYNC_FREQUENCY), 300);
        feed.hold(None, 160);
        feed.hold(Some(1850.0), 150);
        assert_eq!(feed.tracker.collected(), "");
        assert_eq!(feed.tracker.state(), DecoderState::InFrame);
    }

    #[test]
    fn test_short_frame_does_not_close() {
        let mut feed = Feed::new();
        feed.hold(Some(SYNC_FREQUENCY), 300);
        feed.hold(None, 160);
        for c in "PAY".chars() {
            feed.hold(char_to_frequency(c), 150);
            feed.hold(None, 80);
        }
        feed.hold(Some(SYNC_FREQUENCY), 300);
        assert!(feed.emitted.is_empty());
        assert_eq!(feed.tracker.state(), DecoderState::InFrame);
        assert_eq!(feed.tracker.collected(), "PAY");
    }

    #[test]
    fn test_frame_without_prefix_rejected() {
        let mut feed = Feed::new();
        feed.frame("1234ABCD");
        assert!(feed.emitted.is_empty());
        assert_eq!(feed.tracker.stats().frames_rejected, 1);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
    }

    #[test]
    fn test_too_short_token_rejected() {
        let mut feed = Feed::new();
        feed.frame("PAY_1");
        assert!(feed.emitted.is_empty());
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
    }

    #[test]
    fn test_duplicate_within_cooldown_suppressed() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        feed.frame("PAY_1A2B");
        assert_eq!(feed.emitted.len(), 1);
        assert_eq!(feed.tracker.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn test_duplicate_after_cooldown_emitted() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        feed.hold(None, 6_000);
        feed.frame("PAY_1A2B");
        assert_eq!(feed.emitted.len(), 2);
    }

    #[test]
    fn test_different_tokens_back_to_back() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        feed.frame("PAY_3C4D");
        assert_eq!(
            feed.emitted,
            vec![Token::parse("PAY_1A2B").unwrap(), Token::parse("PAY_3C4D").unwrap()]
        );
    }

    #[test]
    fn test_stuck_frame_times_out() {
        let mut feed = Feed::new();
        feed.hold(Some(SYNC_FREQUENCY), 300);
        feed.hold(None, 160);
        feed.hold(char_to_frequency('P'), 150);
        feed.hold(None, 3_500);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
        assert_eq!(feed.tracker.stats().frames_timed_out, 1);
        assert_eq!(feed.tracker.collected(), "");
    }

    #[test]
    fn test_closing_sync_tail_does_not_reopen() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        assert_eq!(feed.tracker.stats().frames_opened, 1);
        assert_eq!(feed.tracker.state(), DecoderState::Idle);
    }

    #[test]
    fn test_reset_clears_duplicate_memory() {
        let mut feed = Feed::new();
        feed.frame("PAY_1A2B");
        feed.tracker.reset();
        feed.frame("PAY_1A2B");
        assert_eq!(feed.emitted.len(), 2);
    }
}
