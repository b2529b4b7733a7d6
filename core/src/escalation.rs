//! Sender-side attempt loop
//!
//! Each attempt broadcasts the token under a louder, slower profile than the
//! last, then polls the payment backend for a bounded window. Delivery is only
//! ever confirmed by the backend; the audio channel carries no acknowledgement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backend::{PaymentBackend, PaymentStatus, Settlement};
use crate::error::{Result, SoundPayError};
use crate::session::{OutputDevice, Speaker};
use crate::token::Token;
use crate::tone::AttemptProfile;
use crate::POLL_INTERVAL_MS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Attempts in the order they are tried
    pub profiles: Vec<AttemptProfile>,
    pub poll_interval_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            profiles: AttemptProfile::default_ladder(),
            poll_interval_ms: POLL_INTERVAL_MS,
        }
    }
}

impl EscalationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            return Err(SoundPayError::InvalidConfig("at least one attempt profile is required".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SoundPayError::InvalidConfig("poll interval must be positive".into()));
        }

        for (index, profile) in self.profiles.iter().enumerate() {
            if !(profile.volume > 0.0 && profile.volume <= 1.0) {
                return Err(SoundPayError::InvalidConfig(format!(
                    "attempt {} volume {} outside (0, 1]",
                    index + 1,
                    profile.volume
                )));
            }
            if profile.tone_ms == 0 || profile.poll_window_ms == 0 {
                return Err(SoundPayError::InvalidConfig(format!(
                    "attempt {} needs a positive tone duration and poll window",
                    index + 1
                )));
            }
        }

        for (index, pair) in self.profiles.windows(2).enumerate() {
            if pair[1].volume < pair[0].volume || pair[1].tone_ms < pair[0].tone_ms {
                return Err(SoundPayError::InvalidConfig(format!(
                    "attempt {} is quieter or shorter than attempt {}",
                    index + 2,
                    index + 1
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    /// The backend reported the payment settled during `attempt` (1-based)
    Settled {
        attempt: usize,
        settlement: Option<Settlement>,
    },
    /// Another run of this controller is still outstanding; nothing was done
    AlreadyActive,
    Cancelled,
}

/// Short tactile confirmation on settlement
pub trait Haptics: Send {
    fn confirm(&mut self);
}

/// For platforms without a vibration motor
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHaptics;

impl Haptics for NoHaptics {
    fn confirm(&mut self) {}
}

/// Stops an outstanding run from another task
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Audio already handed to the device keeps playing; polling stops.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// One finished broadcast and the end of its polling window
#[derive(Debug)]
struct AttemptRecord<'a> {
    index: usize,
    profile: &'a AttemptProfile,
    poll_deadline: Instant,
}

enum PollResult {
    Settled(Option<Settlement>),
    Expired,
    Cancelled,
}

/// Clears the active flag however a run ends
struct ActiveFlag<'a>(&'a AtomicBool);

impl Drop for ActiveFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct EscalationController {
    config: EscalationConfig,
    active: AtomicBool,
    cancel: Arc<watch::Sender<bool>>,
}

impl EscalationController {
    pub fn new(config: EscalationConfig) -> Result<Self> {
        config.validate()?;
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            config,
            active: AtomicBool::new(false),
            cancel: Arc::new(cancel),
        })
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: self.cancel.clone() }
    }

    /// Broadcast `token` with escalating profiles until the backend reports
    /// `payment_id` settled
    ///
    /// Poll failures are logged and retried on the next tick. Running out of
    /// profiles is the only hard failure.
    pub async fn run<O, B, H>(
        &self,
        speaker: &mut Speaker<O>,
        backend: &B,
        payment_id: &str,
        token: &Token,
        haptics: &mut H,
    ) -> Result<EscalationOutcome>
    where
        O: OutputDevice,
        B: PaymentBackend + ?Sized,
        H: Haptics + ?Sized,
    {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("Escalation already running, ignoring request for {}", token);
            return Ok(EscalationOutcome::AlreadyActive);
        }
        let _active = ActiveFlag(&self.active);

        // A cancel aimed at an earlier run must not stop this one
        self.cancel.send_replace(false);
        let mut cancel = self.cancel.subscribe();

        let total = self.config.profiles.len();
        for (index, profile) in self.config.profiles.iter().enumerate() {
            let attempt = index + 1;
            info!(
                "Attempt {}/{} for {}: volume {:.2}, tone {} ms, silence {} ms",
                attempt, total, token, profile.volume, profile.tone_ms, profile.silence_ms
            );

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    info!("Escalation cancelled during attempt {}", attempt);
                    return Ok(EscalationOutcome::Cancelled);
                }
                played = speaker.broadcast(token, profile) => {
                    played?;
                }
            }

            let record = AttemptRecord {
                index: attempt,
                profile,
                poll_deadline: Instant::now() + profile.poll_window(),
            };
            debug!(
                "Attempt {} broadcast at volume {:.2} ({} ms tones, {} ms gaps), polling for {:?}",
                record.index,
                record.profile.volume,
                record.profile.tone_ms,
                record.profile.silence_ms,
                record.poll_deadline.saturating_duration_since(Instant::now())
            );

            match self.poll_until(backend, payment_id, record.poll_deadline, &mut cancel).await {
                PollResult::Settled(settlement) => {
                    info!("Payment {} settled during attempt {}", payment_id, record.index);
                    haptics.confirm();
                    return Ok(EscalationOutcome::Settled { attempt, settlement });
                }
                PollResult::Cancelled => {
                    info!("Escalation cancelled during attempt {}", attempt);
                    return Ok(EscalationOutcome::Cancelled);
                }
                PollResult::Expired => {
                    info!("Attempt {} unconfirmed", attempt);
                }
            }
        }

        warn!("Payment {} not confirmed after {} attempts", payment_id, total);
        Err(SoundPayError::AttemptsExhausted { attempts: total })
    }

    async fn poll_until<B>(
        &self,
        backend: &B,
        payment_id: &str,
        deadline: Instant,
        cancel: &mut watch::Receiver<bool>,
    ) -> PollResult
    where
        B: PaymentBackend + ?Sized,
    {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(cancel) => return PollResult::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return PollResult::Expired,
                _ = ticker.tick() => {}
            }

            // The request races the window and cancellation like the ticker does
            let status = tokio::select! {
                biased;
                _ = cancelled(cancel) => return PollResult::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("{}", SoundPayError::TransientPollError("status request outlived the poll window".into()));
                    return PollResult::Expired;
                }
                status = backend.payment_status(payment_id) => status,
            };

            match status {
                Ok(report) if report.status.is_settled() => {
                    return PollResult::Settled(report.settlement);
                }
                Ok(report) => {
                    if matches!(report.status, PaymentStatus::Expired | PaymentStatus::Failed) {
                        warn!("Payment {} reported {:?}, still polling", payment_id, report.status);
                    }
                }
                Err(e) => {
                    let e = SoundPayError::TransientPollError(e.to_string());
                    warn!("{}", e);
                }
            }
        }
    }
}

/// Resolves once cancellation has been requested
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
