//! Boundary with the payment backend
//!
//! The acoustic channel is one-way; delivery is only ever confirmed by asking
//! the backend whether the payment settled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::Token;
use crate::TOKEN_HEX_CHARS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Complete,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub transaction_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusReport {
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
}

/// Result of creating a payment link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReference {
    pub payment_id: String,
    pub payment_url: String,
    pub token: Token,
}

/// Everything a receiving device needs to act on a decoded token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeemedPayment {
    pub payment_id: String,
    pub store_id: String,
    /// Minor currency units
    pub amount: u64,
    pub status: PaymentStatus,
    pub payment_url: String,
}

#[async_trait]
pub trait PaymentBackend: Send + Sync {
    async fn create_payment(&self, store_id: &str, amount: u64) -> Result<PaymentReference, BackendError>;

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatusReport, BackendError>;

    async fn redeem(&self, token: &Token) -> Result<RedeemedPayment, BackendError>;
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    store_id: String,
    amount: u64,
    token: Token,
    status: PaymentStatus,
    settlement: Option<Settlement>,
    polls: u32,
    // Settle automatically on this status poll
    settle_on_poll: Option<u32>,
}

/// In-process payment ledger for simulation and tests
///
/// Clones share the same ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    ledger: Arc<Mutex<HashMap<String, LedgerEntry>>>,
    base_url: String,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_base_url("https://pay.local")
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            ledger: Arc::default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LedgerEntry>> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn payment_url(&self, payment_id: &str) -> String {
        format!("{}/p/{}", self.base_url, payment_id)
    }

    /// Register a payment under a caller-chosen id
    pub fn insert(&self, payment_id: &str, store_id: &str, amount: u64) -> Result<PaymentReference, BackendError> {
        let token = Token::from_payment_id(payment_id, TOKEN_HEX_CHARS)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        let mut ledger = self.lock();
        if ledger.values().any(|entry| entry.token == token) {
            return Err(BackendError::Rejected(format!("token {} already issued", token)));
        }
        ledger.insert(
            payment_id.to_string(),
            LedgerEntry {
                store_id: store_id.to_string(),
                amount,
                token: token.clone(),
                status: PaymentStatus::Pending,
                settlement: None,
                polls: 0,
                settle_on_poll: None,
            },
        );
        Ok(PaymentReference {
            payment_id: payment_id.to_string(),
            payment_url: self.payment_url(payment_id),
            token,
        })
    }

    /// Mark a payment settled right away
    pub fn settle(&self, payment_id: &str) -> Result<Settlement, BackendError> {
        let mut ledger = self.lock();
        let entry = ledger
            .get_mut(payment_id)
            .ok_or_else(|| BackendError::NotFound(payment_id.to_string()))?;
        Ok(settle_entry(payment_id, entry))
    }

    /// Settle automatically when the `poll`-th status request arrives
    pub fn settle_after_polls(&self, payment_id: &str, poll: u32) -> Result<(), BackendError> {
        let mut ledger = self.lock();
        let entry = ledger
            .get_mut(payment_id)
            .ok_or_else(|| BackendError::NotFound(payment_id.to_string()))?;
        entry.settle_on_poll = Some(poll);
        Ok(())
    }

    pub fn poll_count(&self, payment_id: &str) -> u32 {
        self.lock().get(payment_id).map_or(0, |entry| entry.polls)
    }
}

fn settle_entry(payment_id: &str, entry: &mut LedgerEntry) -> Settlement {
    if let Some(settlement) = &entry.settlement {
        return settlement.clone();
    }
    let settlement = Settlement {
        transaction_ref: format!("tx_{}", payment_id),
        receipt_id: Some(format!("rcpt_{}", entry.token.as_str().to_ascii_lowercase())),
        amount: Some(entry.amount),
    };
    entry.status = PaymentStatus::Paid;
    entry.settlement = Some(settlement.clone());
    settlement
}

#[async_trait]
impl PaymentBackend for InMemoryBackend {
    async fn create_payment(&self, store_id: &str, amount: u64) -> Result<PaymentReference, BackendError> {
        if amount == 0 {
            return Err(BackendError::Rejected("amount must be positive".into()));
        }
        // Sequential hex ids keep derived tokens unique and readable
        let next = self.lock().len() as u64 + 1;
        let payment_id = format!("pm_{:012x}", next);
        self.insert(&payment_id, store_id, amount)
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatusReport, BackendError> {
        let mut ledger = self.lock();
        let entry = ledger
            .get_mut(payment_id)
            .ok_or_else(|| BackendError::NotFound(payment_id.to_string()))?;
        entry.polls += 1;
        if entry.settle_on_poll.is_some_and(|poll| entry.polls >= poll) {
            settle_entry(payment_id, entry);
        }
        Ok(PaymentStatusReport {
            status: entry.status,
            settlement: entry.settlement.clone(),
        })
    }

    async fn redeem(&self, token: &Token) -> Result<RedeemedPayment, BackendError> {
        let ledger = self.lock();
        let (payment_id, entry) = ledger
            .iter()
            .find(|(_, entry)| entry.token == *token)
            .ok_or_else(|| BackendError::NotFound(token.to_string()))?;
        Ok(RedeemedPayment {
            payment_id: payment_id.clone(),
            store_id: entry.store_id.clone(),
            amount: entry.amount,
            status: entry.status,
            payment_url: self.payment_url(payment_id),
        })
    }
}
