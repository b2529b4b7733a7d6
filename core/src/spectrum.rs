//! Band-limited peak detection over a real FFT
//!
//! Each analysis frame is DC-removed, Hann-windowed and transformed. Only bins
//! between the sync tone and the highest symbol tone (plus a margin) are
//! searched, so speech and hum outside the band never win.

use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::error::{Result, SoundPayError};
use crate::symbols::highest_symbol_frequency;
use crate::{BAND_MARGIN, FREQUENCY_STEP, SYNC_FREQUENCY};

/// Strongest in-band tone of one analysis frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub frequency: f32,
    /// Estimated sinusoid amplitude on a 0.0 - 1.0 scale
    pub magnitude: f32,
}

pub struct SpectrumAnalyzer {
    sample_rate: f32,
    fft_size: usize,
    noise_threshold: f32,
    r2c: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    // Scales |X[k]| back to the amplitude of a sinusoid centred on bin k
    amplitude_scale: f32,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    band_start: usize,
    band_end: usize,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32, fft_size: usize, noise_threshold: f32) -> Result<Self> {
        if fft_size < 16 {
            return Err(SoundPayError::InvalidConfig(format!("FFT size {} too small", fft_size)));
        }

        let sr = sample_rate as f32;
        let resolution = sr / fft_size as f32;
        if resolution * 2.0 > FREQUENCY_STEP {
            return Err(SoundPayError::InvalidConfig(format!(
                "frequency resolution {:.1} Hz cannot separate {} Hz symbol steps",
                resolution, FREQUENCY_STEP
            )));
        }

        let band_low = SYNC_FREQUENCY - BAND_MARGIN;
        let band_high = highest_symbol_frequency() + BAND_MARGIN;
        if band_high >= sr / 2.0 {
            return Err(SoundPayError::InvalidConfig(format!(
                "sample rate {} Hz is too low for a {} Hz band edge",
                sample_rate, band_high
            )));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(fft_size);

        let window = hann_window(fft_size);
        let window_sum: f32 = window.iter().sum();

        let input = r2c.make_input_vec();
        let spectrum = r2c.make_output_vec();
        let scratch = r2c.make_scratch_vec();
        let magnitudes = vec![0.0; spectrum.len()];

        let band_start = (band_low / resolution).floor() as usize;
        let band_end = ((band_high / resolution).ceil() as usize).min(spectrum.len() - 1);

        Ok(Self {
            sample_rate: sr,
            fft_size,
            noise_threshold,
            r2c,
            window,
            amplitude_scale: 2.0 / window_sum,
            input,
            spectrum,
            scratch,
            magnitudes,
            band_start,
            band_end,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Width of one FFT bin in Hz
    pub fn resolution(&self) -> f32 {
        self.sample_rate / self.fft_size as f32
    }

    pub fn noise_threshold(&self) -> f32 {
        self.noise_threshold
    }

    pub fn bin_to_frequency(&self, bin: f32) -> f32 {
        bin * self.resolution()
    }

    /// Amplitude spectrum of one frame (one value per bin up to Nyquist)
    pub fn magnitudes(&mut self, frame: &[f32]) -> Result<&[f32]> {
        if frame.len() != self.fft_size {
            return Err(SoundPayError::Fft(format!(
                "analysis frame has {} samples, expected {}",
                frame.len(),
                self.fft_size
            )));
        }

        // Remove DC so offset microphones do not leak into the low bins
        let mean = frame.iter().sum::<f32>() / frame.len() as f32;
        for ((dst, &src), &w) in self.input.iter_mut().zip(frame).zip(&self.window) {
            *dst = (src - mean) * w;
        }

        self.r2c
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| SoundPayError::Fft(format!("forward FFT failed: {:?}", e)))?;

        for (mag, bin) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *mag = bin.norm() * self.amplitude_scale;
        }

        Ok(&self.magnitudes)
    }

    /// Strongest in-band tone, or None if the frame is below the noise threshold
    pub fn dominant(&mut self, frame: &[f32]) -> Result<Option<Detection>> {
        let (start, end) = (self.band_start, self.band_end);
        let resolution = self.resolution();
        let threshold = self.noise_threshold;
        let magnitudes = self.magnitudes(frame)?;

        let mut peak_bin = start;
        let mut peak = magnitudes[start];
        for (bin, &mag) in magnitudes.iter().enumerate().take(end + 1).skip(start) {
            if mag > peak {
                peak = mag;
                peak_bin = bin;
            }
        }

        if peak < threshold {
            return Ok(None);
        }

        // Parabolic interpolation between neighbouring bins
        let offset = if peak_bin > 0 && peak_bin + 1 < magnitudes.len() {
            let left = magnitudes[peak_bin - 1];
            let right = magnitudes[peak_bin + 1];
            let denom = left - 2.0 * peak + right;
            if denom.abs() > f32::EPSILON {
                (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
            } else {
                0.0
            }
        } else {
            0.0
        };

        Ok(Some(Detection {
            frequency: (peak_bin as f32 + offset) * resolution,
            magnitude: peak,
        }))
    }
}

/// Periodic Hann window
fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / len as f32).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FFT_SIZE, NOISE_THRESHOLD, SAMPLE_RATE};

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin() * amplitude)
            .collect()
    }

    fn analyzer() -> SpectrumAnalyzer {
        SpectrumAnalyzer::new(SAMPLE_RATE as u32, FFT_SIZE, NOISE_THRESHOLD).unwrap()
    }

    #[test]
    fn test_resolution_finer_than_step() {
        let a = analyzer();
        assert!(a.resolution() * 2.0 < FREQUENCY_STEP);
    }

    #[test]
    fn test_rejects_coarse_fft() {
        assert!(SpectrumAnalyzer::new(48000, 256, NOISE_THRESHOLD).is_err());
    }

    #[test]
    fn test_rejects_low_sample_rate() {
        assert!(SpectrumAnalyzer::new(8000, 2048, NOISE_THRESHOLD).is_err());
    }

    #[test]
    fn test_detects_symbol_tone() {
        let mut a = analyzer();
        let frame = sine(2500.0, 0.5, FFT_SIZE);
        let detection = a.dominant(&frame).unwrap().unwrap();
        assert!((detection.frequency - 2500.0).abs() < 5.0, "got {}", detection.frequency);
        assert!(detection.magnitude > 0.35 && detection.magnitude < 0.55, "got {}", detection.magnitude);
    }

    #[test]
    fn test_detects_sync_tone() {
        let mut a = analyzer();
        let frame = sine(SYNC_FREQUENCY, 0.3, FFT_SIZE);
        let detection = a.dominant(&frame).unwrap().unwrap();
        assert!((detection.frequency - SYNC_FREQUENCY).abs() < 5.0);
    }

    #[test]
    fn test_silence_is_no_detection() {
        let mut a = analyzer();
        assert_eq!(a.dominant(&vec![0.0; FFT_SIZE]).unwrap(), None);
    }

    #[test]
    fn test_quiet_tone_below_threshold() {
        let mut a = analyzer();
        let frame = sine(2500.0, NOISE_THRESHOLD / 4.0, FFT_SIZE);
        assert_eq!(a.dominant(&frame).unwrap(), None);
    }

    #[test]
    fn test_out_of_band_tone_ignored() {
        let mut a = analyzer();
        // Loud 440 Hz hum plus a quiet in-band symbol tone
        let hum = sine(440.0, 0.8, FFT_SIZE);
        let symbol = sine(3000.0, 0.1, FFT_SIZE);
        let frame: Vec<f32> = hum.iter().zip(&symbol).map(|(a, b)| a + b).collect();
        let detection = a.dominant(&frame).unwrap().unwrap();
        assert!((detection.frequency - 3000.0).abs() < 5.0);
    }

    #[test]
    fn test_dc_offset_ignored() {
        let mut a = analyzer();
        let frame: Vec<f32> = sine(2000.0, 0.2, FFT_SIZE).iter().map(|s| s + 0.5).collect();
        let detection = a.dominant(&frame).unwrap().unwrap();
        assert!((detection.frequency - 2000.0).abs() < 5.0);
    }

    #[test]
    fn test_wrong_frame_length() {
        let mut a = analyzer();
        assert!(a.dominant(&[0.0; 100]).is_err());
    }
}
