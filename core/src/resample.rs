//! Capture-side sample conditioning
//!
//! Devices and WAV files hand us interleaved or integer audio; the decoder
//! wants mono `f32`. Rate differences are absorbed by resizing the decoder.

/// Average interleaved frames down to one channel
///
/// A trailing partial frame is dropped.
pub fn interleaved_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Scale signed 16-bit PCM into [-1.0, 1.0)
pub fn pcm_i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Scale `f32` audio to 16-bit PCM, clamping anything outside [-1.0, 1.0]
pub fn f32_to_pcm_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}
