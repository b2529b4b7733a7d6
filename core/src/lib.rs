//! Acoustic proximity payment transport
//!
//! Moves a short payment token between two nearby devices using audible
//! single-tone FSK: a sync tone, one tone per token character, and a closing
//! sync tone. The sender escalates loudness and duration across attempts and
//! confirms delivery out of band against the payment backend.

pub mod error;
pub mod symbols;
pub mod token;
pub mod tone;
pub mod spectrum;
pub mod detector;
pub mod decoder;
pub mod resample;
pub mod session;
pub mod loopback;
pub mod backend;
pub mod escalation;

pub use backend::{
    BackendError, InMemoryBackend, PaymentBackend, PaymentReference, PaymentStatus,
    PaymentStatusReport, RedeemedPayment, Settlement,
};
pub use decoder::{DecoderConfig, SpectralDecoder};
pub use detector::{DecoderState, DecoderStats, FrameTracker};
pub use error::{EncodingError, Result, SoundPayError};
pub use loopback::{loopback, LoopbackInput, LoopbackOutput};
pub use escalation::{
    CancelHandle, EscalationConfig, EscalationController, EscalationOutcome, Haptics, NoHaptics,
};
pub use session::{AudioSession, Capture, InputDevice, Microphone, OutputDevice, Speaker, TokenStream};
pub use spectrum::{Detection, SpectrumAnalyzer};
pub use token::Token;
pub use tone::{AttemptProfile, ScheduledTone, ToneEncoder, ToneKind, ToneSchedule};

// Audio configuration
pub const SAMPLE_RATE: usize = 48000;
pub const FFT_SIZE: usize = 2048;
pub const HOP_SIZE: usize = 512; // ~10.7ms, close to one animation tick

// Frequency map
pub const BASE_FREQUENCY: f32 = 1800.0; // Hz
pub const FREQUENCY_STEP: f32 = 100.0; // Hz
pub const SYNC_FREQUENCY: f32 = 1200.0; // Hz, below the symbol band
pub const BAND_MARGIN: f32 = 100.0; // Hz on each side of the search band
pub const SYNC_TOLERANCE: f32 = 40.0; // Hz
pub const SYMBOL_TOLERANCE: f32 = 40.0; // Hz

// Token rules
pub const TOKEN_PREFIX: &str = "PAY_";
pub const MIN_TOKEN_LEN: usize = 8;
pub const MAX_TOKEN_LEN: usize = 32;
pub const TOKEN_HEX_CHARS: usize = 8;

// Tone shaping
pub const LEAD_IN_MS: u64 = 100;
pub const ENVELOPE_RAMP_MS: u64 = 10;
pub const SYNC_DURATION_FACTOR: u32 = 2;

// Decoder timing
pub const NOISE_THRESHOLD: f32 = 0.02;
pub const MIN_CHAR_INTERVAL_MS: u64 = 350;
pub const SILENCE_RESET_MS: u64 = 25;
pub const FRAME_TIMEOUT_MS: u64 = 3000;
pub const DUPLICATE_COOLDOWN_MS: u64 = 5000;
pub const MIN_FRAME_CHARS: usize = 4;

// Escalation
pub const POLL_INTERVAL_MS: u64 = 500;
