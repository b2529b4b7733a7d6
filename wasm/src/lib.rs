use std::time::Duration;

use js_sys::Array;
use soundpay_core::{
    AttemptProfile, DecoderConfig, DecoderState, SpectralDecoder, Token, ToneEncoder, ENVELOPE_RAMP_MS,
};
use wasm_bindgen::prelude::*;
use web_sys::{AnalyserNode, AudioContext, OscillatorType};

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Plays tokens through Web Audio oscillators
#[wasm_bindgen]
pub struct WasmBroadcaster {
    profiles: Vec<AttemptProfile>,
}

#[wasm_bindgen]
impl WasmBroadcaster {
    #[wasm_bindgen(constructor)]
    pub fn new() -> WasmBroadcaster {
        WasmBroadcaster { profiles: AttemptProfile::default_ladder() }
    }

    #[wasm_bindgen(js_name = attemptCount)]
    pub fn attempt_count(&self) -> usize {
        self.profiles.len()
    }

    /// Schedule one broadcast of `token` using escalation profile `attempt`
    /// (1-based). Returns the context time at which the broadcast ends.
    #[wasm_bindgen]
    pub fn broadcast(&self, ctx: &AudioContext, token: &str, attempt: usize) -> Result<f64, JsValue> {
        let profile = attempt
            .checked_sub(1)
            .and_then(|index| self.profiles.get(index))
            .ok_or_else(|| js_error(format!("attempt must be between 1 and {}", self.profiles.len())))?;
        let token = Token::parse(token).map_err(js_error)?;
        let schedule = ToneEncoder::with_sample_rate(ctx.sample_rate() as u32).schedule_token(&token, profile);

        let start = ctx.current_time();
        let ramp = Duration::from_millis(ENVELOPE_RAMP_MS).as_secs_f64();
        let destination = ctx.destination();

        for tone in schedule.tones() {
            let t0 = start + tone.start.as_secs_f64();
            let t1 = start + tone.end().as_secs_f64();
            let ramp = ramp.min((t1 - t0) / 2.0);
            let volume = tone.volume;

            let oscillator = ctx.create_oscillator()?;
            oscillator.set_type(OscillatorType::Sine);
            oscillator.frequency().set_value(tone.frequency);

            let gain = ctx.create_gain()?;
            let envelope = gain.gain();
            envelope.set_value_at_time(0.0, t0)?;
            envelope.linear_ramp_to_value_at_time(volume, t0 + ramp)?;
            envelope.set_value_at_time(volume, t1 - ramp)?;
            envelope.linear_ramp_to_value_at_time(0.0, t1)?;

            oscillator.connect_with_audio_node(&gain)?;
            gain.connect_with_audio_node(&destination)?;
            oscillator.start_with_when(t0)?;
            oscillator.stop_with_when(t1)?;
        }

        Ok(start + schedule.total_duration().as_secs_f64())
    }
}

impl Default for WasmBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming decoder fed from an `AnalyserNode` or raw sample blocks
#[wasm_bindgen]
pub struct WasmListener {
    decoder: SpectralDecoder,
    frame: Vec<f32>,
}

#[wasm_bindgen]
impl WasmListener {
    /// Decoder sized for `sample_rate`. Set the analyser's `fftSize` to
    /// `fftSize()` before polling.
    #[wasm_bindgen(constructor)]
    pub fn new(sample_rate: f32) -> Result<WasmListener, JsValue> {
        let config = DecoderConfig::for_sample_rate(sample_rate as u32);
        let frame = vec![0.0; config.fft_size];
        let decoder = SpectralDecoder::new(config).map_err(js_error)?;
        Ok(WasmListener { decoder, frame })
    }

    #[wasm_bindgen(js_name = fftSize)]
    pub fn fft_size(&self) -> usize {
        self.decoder.config().fft_size
    }

    /// Analyse the analyser's current window; call once per animation frame.
    /// Returns the tokens completed by this frame.
    #[wasm_bindgen]
    pub fn poll(&mut self, analyser: &AnalyserNode) -> Result<Array, JsValue> {
        if analyser.fft_size() as usize != self.frame.len() {
            return Err(js_error(format!(
                "analyser fftSize is {}, expected {}",
                analyser.fft_size(),
                self.frame.len()
            )));
        }
        analyser.get_float_time_domain_data(&mut self.frame);
        let now = Duration::from_secs_f64(analyser.context().current_time());

        let tokens = Array::new();
        if let Some(token) = self.decoder.push_frame(&self.frame, now).map_err(js_error)? {
            tokens.push(&JsValue::from_str(token.as_str()));
        }
        Ok(tokens)
    }

    /// Feed raw capture samples, e.g. from an AudioWorklet
    #[wasm_bindgen(js_name = pushSamples)]
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<Array, JsValue> {
        let tokens = self.decoder.push_samples(samples).map_err(js_error)?;
        Ok(tokens.iter().map(|token| JsValue::from_str(token.as_str())).collect())
    }

    #[wasm_bindgen(js_name = inFrame)]
    pub fn in_frame(&self) -> bool {
        self.decoder.state() == DecoderState::InFrame
    }

    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.decoder.reset();
    }
}
