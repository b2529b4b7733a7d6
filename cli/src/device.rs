//! Default speaker and microphone through cpal
//!
//! cpal streams are not `Send`, so each stream lives on its own thread and
//! the async side only holds channels to it.

use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use soundpay_core::resample::{interleaved_to_mono, pcm_i16_to_f32};
use soundpay_core::{Capture, InputDevice, OutputDevice, Result, SoundPayError};
use tokio::sync::{mpsc, oneshot};

/// Blocks buffered between the audio callback and the decoder
const CAPTURE_BUFFER: usize = 256;

/// Extra time the output stream stays alive after the last sample
const DRAIN_MARGIN: Duration = Duration::from_millis(250);

/// Backends only report OS permission refusals as free text
const PERMISSION_MARKERS: [&str; 4] = ["permission", "denied", "not authorized", "eacces"];

fn unavailable(context: &str, error: impl std::fmt::Display) -> SoundPayError {
    let message = format!("{}: {}", context, error);
    let lower = message.to_lowercase();
    if PERMISSION_MARKERS.iter().any(|marker| lower.contains(marker)) {
        SoundPayError::PermissionDenied(message)
    } else {
        SoundPayError::DeviceUnavailable(message)
    }
}

pub struct CpalOutput {
    sample_rate: u32,
    channels: usize,
}

impl CpalOutput {
    pub fn open_default() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| SoundPayError::DeviceUnavailable("no default output device".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| unavailable("output config", e))?;
        Ok(Self {
            sample_rate: config.sample_rate().0,
            channels: usize::from(config.channels().max(1)),
        })
    }
}

fn build_output_stream(samples: Vec<f32>, channels: usize) -> Result<Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| SoundPayError::DeviceUnavailable("no default output device".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| unavailable("output config", e))?;
    if config.sample_format() != SampleFormat::F32 {
        return Err(SoundPayError::DeviceUnavailable(format!(
            "unsupported output sample format: {:?}",
            config.sample_format()
        )));
    }

    let mut cursor = 0;
    device
        .build_output_stream(
            &config.config(),
            move |data: &mut [f32], _| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(cursor).copied().unwrap_or(0.0);
                    cursor += 1;
                    frame.iter_mut().for_each(|s| *s = sample);
                }
            },
            |error| log::warn!("Output stream error: {}", error),
            None,
        )
        .map_err(|e| unavailable("output stream", e))
}

#[async_trait]
impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn play(&mut self, samples: Vec<f32>) -> Result<()> {
        let channels = self.channels;
        let hold = Duration::from_secs_f64(samples.len() as f64 / self.sample_rate as f64) + DRAIN_MARGIN;
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::spawn(move || {
            let stream = match build_output_stream(samples, channels) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(unavailable("output start", e)));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            thread::sleep(hold);
        });

        ready_rx
            .await
            .map_err(|_| SoundPayError::DeviceUnavailable("output thread exited".into()))?
    }
}

/// Stops the capture thread, and with it the stream, when dropped
struct StopOnDrop(std_mpsc::Sender<()>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

#[derive(Default)]
pub struct CpalInput;

fn build_input_stream(tx: mpsc::Sender<Vec<f32>>) -> Result<(Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| SoundPayError::DeviceUnavailable("no default input device".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| unavailable("input config", e))?;
    let sample_format = supported.sample_format();
    let config = supported.config();
    let sample_rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));
    let on_error = |error| log::warn!("Input stream error: {}", error);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let _ = tx.try_send(interleaved_to_mono(data, channels));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let _ = tx.try_send(interleaved_to_mono(&pcm_i16_to_f32(data), channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(SoundPayError::DeviceUnavailable(format!(
                "unsupported input sample format: {:?}",
                other
            )));
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => SoundPayError::DeviceBusy,
        other => unavailable("input stream", other),
    })?;

    Ok((stream, sample_rate))
}

#[async_trait]
impl InputDevice for CpalInput {
    async fn open(&mut self) -> Result<Capture> {
        let (tx, samples) = mpsc::channel(CAPTURE_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::spawn(move || {
            let (stream, sample_rate) = match build_input_stream(tx) {
                Ok(built) => built,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(unavailable("input start", e)));
                return;
            }
            let _ = ready_tx.send(Ok(sample_rate));
            // Either a stop message or the guard being dropped ends capture
            let _ = stop_rx.recv();
        });

        let sample_rate = ready_rx
            .await
            .map_err(|_| SoundPayError::DeviceUnavailable("input thread exited".into()))??;
        Ok(Capture {
            sample_rate,
            samples,
            guard: Box::new(StopOnDrop(stop_tx)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{BackendSpecificError, BuildStreamError, PlayStreamError};

    #[test]
    fn test_backend_permission_failure_is_permission_denied() {
        let err = BuildStreamError::BackendSpecific {
            err: BackendSpecificError { description: "snd_pcm_open: Permission denied".into() },
        };
        assert!(matches!(unavailable("input stream", err), SoundPayError::PermissionDenied(_)));

        let err = PlayStreamError::BackendSpecific {
            err: BackendSpecificError { description: "Microphone access not authorized".into() },
        };
        assert!(matches!(unavailable("input start", err), SoundPayError::PermissionDenied(_)));
    }

    #[test]
    fn test_other_failures_are_unavailable() {
        let err = BuildStreamError::StreamConfigNotSupported;
        assert!(matches!(unavailable("output stream", err), SoundPayError::DeviceUnavailable(_)));
    }
}
