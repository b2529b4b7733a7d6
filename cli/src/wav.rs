use std::path::Path;

use hound::{SampleFormat, WavSpec};
use soundpay_core::resample::{f32_to_pcm_i16, interleaved_to_mono};

use crate::error::{CliError, Result};

/// Write mono 16-bit PCM
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in f32_to_pcm_i16(samples) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read any integer or 32-bit float WAV as mono `f32`, with its sample rate
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        (SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
        (format, bits) => {
            return Err(CliError::UnsupportedFormat(format!("{:?} at {} bits", format, bits)));
        }
    };

    Ok((interleaved_to_mono(&interleaved, spec.channels as usize), spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("soundpay-wav-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_write_then_read() {
        let path = temp_path("mono.wav");
        let samples = vec![0.0, 0.5, -0.5, 0.25];
        write_wav(&path, &samples, 16000).unwrap();

        let (read, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(read.len(), samples.len());
        for (a, b) in read.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-3);
        }
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_stereo_float_downmixed() {
        let path = temp_path("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.2f32, 0.4, -0.2, -0.4] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let (read, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 48000);
        assert_eq!(read.len(), 2);
        assert!((read[0] - 0.3).abs() < 1e-6);
        assert!((read[1] + 0.3).abs() < 1e-6);
        std::fs::remove_file(path).ok();
    }
}
