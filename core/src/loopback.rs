//! Speaker wired straight into a microphone
//!
//! Whatever the loopback output plays arrives, block by block, at the
//! loopback input, if it is open. Used by the simulator and by tests that
//! exercise the whole acoustic path without hardware.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::{Result, SoundPayError};
use crate::session::{Capture, InputDevice, OutputDevice};

/// Samples per block delivered to the input, roughly one audio callback
pub const LOOPBACK_BLOCK: usize = 1024;

/// Blocks buffered before the output starts dropping audio
const LOOPBACK_CAPACITY: usize = 4096;

#[derive(Default)]
struct Wire {
    listener: Option<mpsc::Sender<Vec<f32>>>,
    // Broadcasts still to be swallowed before audio gets through
    muted: usize,
    gain: Option<f32>,
}

fn lock(wire: &Mutex<Wire>) -> MutexGuard<'_, Wire> {
    wire.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LoopbackOutput {
    sample_rate: u32,
    wire: Arc<Mutex<Wire>>,
}

pub struct LoopbackInput {
    sample_rate: u32,
    wire: Arc<Mutex<Wire>>,
}

/// A connected output/input pair running at `sample_rate`
pub fn loopback(sample_rate: u32) -> (LoopbackOutput, LoopbackInput) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    (
        LoopbackOutput { sample_rate, wire: wire.clone() },
        LoopbackInput { sample_rate, wire },
    )
}

impl LoopbackOutput {
    /// Let the next `count` broadcasts vanish, as if the payee were out of earshot
    pub fn mute_next(&self, count: usize) {
        lock(&self.wire).muted = count;
    }

    /// Scale everything played from now on, simulating distance
    pub fn set_gain(&self, gain: f32) {
        lock(&self.wire).gain = Some(gain);
    }
}

#[async_trait]
impl OutputDevice for LoopbackOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn play(&mut self, samples: Vec<f32>) -> Result<()> {
        let mut wire = lock(&self.wire);
        if wire.muted > 0 {
            wire.muted -= 1;
            debug!("Loopback muted, dropping {} samples", samples.len());
            return Ok(());
        }

        let gain = wire.gain.unwrap_or(1.0);
        let Some(listener) = wire.listener.as_ref() else {
            return Ok(());
        };

        for block in samples.chunks(LOOPBACK_BLOCK) {
            let block: Vec<f32> = block.iter().map(|s| s * gain).collect();
            if listener.try_send(block).is_err() {
                warn!("Loopback listener not keeping up, audio dropped");
                break;
            }
        }
        Ok(())
    }
}

/// Detaches the listener when the capture is released
struct WireGuard(Arc<Mutex<Wire>>);

impl Drop for WireGuard {
    fn drop(&mut self) {
        lock(&self.0).listener = None;
    }
}

#[async_trait]
impl InputDevice for LoopbackInput {
    async fn open(&mut self) -> Result<Capture> {
        let mut wire = lock(&self.wire);
        if wire.listener.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(SoundPayError::DeviceBusy);
        }
        let (tx, samples) = mpsc::channel(LOOPBACK_CAPACITY);
        wire.listener = Some(tx);
        Ok(Capture {
            sample_rate: self.sample_rate,
            samples,
            guard: Box::new(WireGuard(self.wire.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audio_reaches_open_input() {
        let (mut output, mut input) = loopback(48000);
        let mut capture = input.open().await.unwrap();
        output.play(vec![0.5; LOOPBACK_BLOCK + 10]).await.unwrap();

        let first = capture.samples.recv().await.unwrap();
        let second = capture.samples.recv().await.unwrap();
        assert_eq!(first.len(), LOOPBACK_BLOCK);
        assert_eq!(second.len(), 10);
    }

    #[tokio::test]
    async fn test_input_is_exclusive() {
        let (_output, mut input) = loopback(48000);
        let capture = input.open().await.unwrap();
        assert!(matches!(input.open().await, Err(SoundPayError::DeviceBusy)));
        drop(capture);
        assert!(input.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_muted_broadcasts_dropped() {
        let (mut output, mut input) = loopback(48000);
        let mut capture = input.open().await.unwrap();
        output.mute_next(1);
        output.play(vec![0.1; 4]).await.unwrap();
        output.play(vec![0.2; 4]).await.unwrap();
        assert_eq!(capture.samples.recv().await.unwrap(), vec![0.2; 4]);
    }

    #[tokio::test]
    async fn test_gain_applied() {
        let (mut output, mut input) = loopback(48000);
        let mut capture = input.open().await.unwrap();
        output.set_gain(0.5);
        output.play(vec![0.8; 2]).await.unwrap();
        assert_eq!(capture.samples.recv().await.unwrap(), vec![0.4; 2]);
    }

    #[tokio::test]
    async fn test_play_without_listener_is_silent() {
        let (mut output, _input) = loopback(48000);
        assert!(output.play(vec![0.5; 100]).await.is_ok());
    }
}
