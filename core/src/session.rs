//! Ownership of the speaker and microphone
//!
//! `AudioSession` is the only thing that touches raw devices. The speaker side
//! serialises broadcasts through `&mut self`; the microphone side keeps at most
//! one listening session alive and releases the capture device whenever that
//! session ends, however it ends.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{PaymentBackend, RedeemedPayment};
use crate::decoder::{DecoderConfig, SpectralDecoder};
use crate::error::{Result, SoundPayError};
use crate::token::Token;
use crate::tone::{AttemptProfile, ToneEncoder, ToneSchedule};

/// Tokens buffered between the analysis loop and the consumer
const TOKEN_BUFFER: usize = 8;

#[async_trait]
pub trait OutputDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Hand PCM to the device. Returns once playback has been queued;
    /// the speaker waits out the playback time itself.
    async fn play(&mut self, samples: Vec<f32>) -> Result<()>;
}

/// An acquired microphone
pub struct Capture {
    pub sample_rate: u32,
    /// Mono sample blocks in capture order
    pub samples: mpsc::Receiver<Vec<f32>>,
    /// Holding this keeps the device open; dropping it releases the device
    pub guard: Box<dyn Any + Send>,
}

#[async_trait]
pub trait InputDevice: Send {
    /// Acquire the microphone. May wait on a platform permission prompt.
    async fn open(&mut self) -> Result<Capture>;
}

/// Output side of the session
pub struct Speaker<O> {
    device: O,
    encoder: ToneEncoder,
}

impl<O: OutputDevice> Speaker<O> {
    pub fn new(device: O) -> Self {
        let encoder = ToneEncoder::with_sample_rate(device.sample_rate());
        Self { device, encoder }
    }

    pub fn device(&self) -> &O {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut O {
        &mut self.device
    }

    /// Play one full frame for `token` and return once its last tone has ended
    pub async fn broadcast(&mut self, token: &Token, profile: &AttemptProfile) -> Result<ToneSchedule> {
        let schedule = self.encoder.schedule_token(token, profile);
        let pcm = schedule.render(self.encoder.sample_rate());

        let started = Instant::now();
        self.device.play(pcm).await?;
        debug!(
            "Broadcasting {} at volume {:.2} for {:?}",
            token,
            profile.volume,
            schedule.total_duration()
        );
        tokio::time::sleep_until(started + schedule.total_duration()).await;

        Ok(schedule)
    }
}

struct ActiveListen {
    task: JoinHandle<()>,
    _guard: Box<dyn Any + Send>,
}

impl Drop for ActiveListen {
    fn drop(&mut self) {
        // Stop analysis first; the capture guard is released right after
        self.task.abort();
    }
}

/// Input side of the session
pub struct Microphone<I> {
    device: I,
    active: Option<ActiveListen>,
}

impl<I: InputDevice> Microphone<I> {
    pub fn new(device: I) -> Self {
        Self { device, active: None }
    }

    pub fn device(&self) -> &I {
        &self.device
    }

    pub fn is_listening(&self) -> bool {
        self.active.as_ref().is_some_and(|active| !active.task.is_finished())
    }

    /// Start a listening session and return its token stream
    ///
    /// Any session already running is torn down first. If the decoder's sample
    /// rate differs from the device's, the transform is resized for the device.
    pub async fn listen(&mut self, config: DecoderConfig) -> Result<TokenStream> {
        if self.active.is_some() {
            warn!("Listening session already active, stopping it first");
            self.stop();
        }

        let capture = self.device.open().await?;
        let config = config.resized_for(capture.sample_rate);

        // On failure `capture` drops here and the device is released
        let mut decoder = SpectralDecoder::new(config)?;
        let Capture { mut samples, guard, sample_rate } = capture;

        let (tx, rx) = mpsc::channel(TOKEN_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(block) = samples.recv().await {
                let tokens = match decoder.push_samples(&block) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!("Analysis failed, ending listening session: {}", e);
                        break;
                    }
                };
                for token in tokens {
                    if tx.send(token).await.is_err() {
                        debug!("Token stream dropped, ending analysis");
                        return;
                    }
                }
            }
            debug!("Capture ended after {:?}: {:?}", decoder.elapsed(), decoder.stats());
        });

        info!("Listening at {} Hz", sample_rate);
        self.active = Some(ActiveListen { task, _guard: guard });
        Ok(TokenStream { rx })
    }

    /// End the listening session and release the microphone. Safe to call twice.
    pub fn stop(&mut self) {
        if self.active.take().is_some() {
            info!("Listening session stopped, microphone released");
        }
    }
}

/// Decoded tokens from one listening session
///
/// Ends when the session is stopped or the capture device goes away.
pub struct TokenStream {
    rx: mpsc::Receiver<Token>,
}

impl TokenStream {
    /// Next token, or None once the session has ended
    pub async fn next(&mut self) -> Option<Token> {
        self.rx.recv().await
    }

    /// Next token within `window`
    ///
    /// `NoSignalDetected` means nothing arrived in time; the session keeps running.
    pub async fn next_within(&mut self, window: Duration) -> Result<Token> {
        match tokio::time::timeout(window, self.rx.recv()).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(SoundPayError::DeviceUnavailable("listening session ended".into())),
            Err(_) => Err(SoundPayError::NoSignalDetected),
        }
    }
}

/// Sole owner of one device pair
pub struct AudioSession<O, I> {
    speaker: Speaker<O>,
    microphone: Microphone<I>,
}

impl<O: OutputDevice, I: InputDevice> AudioSession<O, I> {
    pub fn new(output: O, input: I) -> Self {
        Self {
            speaker: Speaker::new(output),
            microphone: Microphone::new(input),
        }
    }

    pub fn speaker(&mut self) -> &mut Speaker<O> {
        &mut self.speaker
    }

    pub fn microphone(&mut self) -> &mut Microphone<I> {
        &mut self.microphone
    }

    /// Borrow both halves at once so sending and listening can run together
    pub fn split(&mut self) -> (&mut Speaker<O>, &mut Microphone<I>) {
        (&mut self.speaker, &mut self.microphone)
    }

    /// Listen for one token, release the microphone, then resolve the token
    ///
    /// The microphone is released before this returns, whether a token
    /// arrived, the window ran out, or the backend failed.
    pub async fn receive_and_redeem<B>(
        &mut self,
        backend: &B,
        config: DecoderConfig,
        window: Duration,
    ) -> Result<(Token, RedeemedPayment)>
    where
        B: PaymentBackend + ?Sized,
    {
        let mut stream = self.microphone.listen(config).await?;
        let received = stream.next_within(window).await;
        self.microphone.stop();

        let token = received?;
        let payment = backend.redeem(&token).await?;
        info!("Redeemed {} for payment {}", token, payment.payment_id);
        Ok((token, payment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingOutput {
        played: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutputDevice for CountingOutput {
        fn sample_rate(&self) -> u32 {
            16000
        }

        async fn play(&mut self, samples: Vec<f32>) -> Result<()> {
            self.played.fetch_add(samples.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct DeniedInput;

    #[async_trait]
    impl InputDevice for DeniedInput {
        async fn open(&mut self) -> Result<Capture> {
            Err(SoundPayError::PermissionDenied("microphone".into()))
        }
    }

    /// Input that can only be opened once at a time
    struct ExclusiveInput {
        open: Arc<AtomicBool>,
    }

    struct ReleaseOnDrop(Arc<AtomicBool>);

    impl Drop for ReleaseOnDrop {
        fn drop(&mut self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl InputDevice for ExclusiveInput {
        async fn open(&mut self) -> Result<Capture> {
            if self.open.swap(true, Ordering::SeqCst) {
                return Err(SoundPayError::DeviceBusy);
            }
            // The sender lives in the guard so the capture stays open but silent
            let (tx, samples) = mpsc::channel(1);
            Ok(Capture {
                sample_rate: 48000,
                samples,
                guard: Box::new((ReleaseOnDrop(self.open.clone()), tx)),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_waits_for_schedule() {
        let played = Arc::new(AtomicUsize::new(0));
        let mut speaker = Speaker::new(CountingOutput { played: played.clone() });
        let token = Token::parse("PAY_1A2B").unwrap();
        let profile = AttemptProfile::default();

        let started = Instant::now();
        let schedule = speaker.broadcast(&token, &profile).await.unwrap();

        assert_eq!(started.elapsed(), schedule.total_duration());
        let expected = (schedule.total_duration().as_secs_f32() * 16000.0).round() as usize;
        assert_eq!(played.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let mut mic = Microphone::new(DeniedInput);
        let result = mic.listen(DecoderConfig::default()).await;
        assert!(matches!(result, Err(SoundPayError::PermissionDenied(_))));
        assert!(!mic.is_listening());
    }

    #[tokio::test]
    async fn test_stop_releases_device() {
        let open = Arc::new(AtomicBool::new(false));
        let mut mic = Microphone::new(ExclusiveInput { open: open.clone() });

        let _stream = mic.listen(DecoderConfig::default()).await.unwrap();
        assert!(open.load(Ordering::SeqCst));
        mic.stop();
        assert!(!open.load(Ordering::SeqCst));
        mic.stop();

        let _again = mic.listen(DecoderConfig::default()).await.unwrap();
        assert!(open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_listen_replaces_first() {
        let open = Arc::new(AtomicBool::new(false));
        let mut mic = Microphone::new(ExclusiveInput { open: open.clone() });

        let _first = mic.listen(DecoderConfig::default()).await.unwrap();
        // Would be DeviceBusy if the first session were not torn down
        let _second = mic.listen(DecoderConfig::default()).await.unwrap();
        assert!(open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let open = Arc::new(AtomicBool::new(false));
        {
            let mut mic = Microphone::new(ExclusiveInput { open: open.clone() });
            let _stream = mic.listen(DecoderConfig::default()).await.unwrap();
            assert!(open.load(Ordering::SeqCst));
        }
        assert!(!open.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_config_releases_device() {
        let open = Arc::new(AtomicBool::new(false));
        let mut mic = Microphone::new(ExclusiveInput { open: open.clone() });
        let bad = DecoderConfig { hop_size: 0, ..DecoderConfig::default() };
        assert!(mic.listen(bad).await.is_err());
        assert!(!open.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_signal_is_reported() {
        let open = Arc::new(AtomicBool::new(false));
        let mut session = AudioSession::new(
            CountingOutput { played: Arc::default() },
            ExclusiveInput { open: open.clone() },
        );
        let backend = crate::backend::InMemoryBackend::new();
        let result = session
            .receive_and_redeem(&backend, DecoderConfig::default(), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(SoundPayError::NoSignalDetected)));
        assert!(!open.load(Ordering::SeqCst));
    }
}
