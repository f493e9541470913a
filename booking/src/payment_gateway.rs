//! Payment collaborator.
//!
//! The core only needs an opaque authorization for an amount and a
//! description, plus a reference it can record on the rows the payment pays
//! for. Amounts are never re-validated here.

use crate::types::{Money, PaymentReference};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Payment gateway error
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentGatewayError {
    /// The payer's provider refused
    #[error("Payment declined: {reason}")]
    Declined {
        /// Decline reason
        reason: String,
    },

    /// The payer closed the payment sheet
    #[error("Payment cancelled")]
    Cancelled,

    /// No answer within the authorization deadline
    #[error("Payment authorization timed out")]
    Timeout,

    /// The gateway could not be reached
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
}

/// Successful authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    /// Correlation reference to record on committed rows
    pub reference: PaymentReference,
    /// Amount authorized
    pub amount: Money,
}

/// Payment gateway trait
///
/// Abstraction over the hosted payment service.
pub trait PaymentGateway: Send + Sync {
    /// Request authorization of `amount`
    ///
    /// Resolves once the payer completes, cancels or the provider declines.
    ///
    /// # Errors
    ///
    /// Returns a [`PaymentGatewayError`] if no money was authorized.
    fn authorize(
        &self,
        amount: Money,
        description: String,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentAuthorization>> + Send + '_>>;
}

/// Scripted answer for [`MockPaymentGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Authorize with a fresh reference
    Approve,
    /// Decline with a reason
    Decline(String),
    /// Payer cancels
    Cancel,
    /// Gateway unreachable
    Unavailable,
}

/// A recorded authorization request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Amount requested
    pub amount: Money,
    /// Description shown to the payer
    pub description: String,
}

/// Mock payment gateway for tests and the demo
///
/// Approves everything unless outcomes are queued. An optional delay holds
/// every answer back, which lets tests cancel mid-authorization or trip the
/// authorization deadline.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    script: Mutex<VecDeque<MockOutcome>>,
    delay_ms: Mutex<u64>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AuthorizationRequest>>,
}

impl MockPaymentGateway {
    /// Creates a gateway that approves everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Queue the answer for a future call
    pub fn push_outcome(&self, outcome: MockOutcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    /// Decline the next call
    pub fn decline_next(&self, reason: impl Into<String>) {
        self.push_outcome(MockOutcome::Decline(reason.into()));
    }

    /// Cancel the next call
    pub fn cancel_next(&self) {
        self.push_outcome(MockOutcome::Cancel);
    }

    /// Hold every answer back by `delay`
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut delay_ms) = self.delay_ms.lock() {
            *delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        }
    }

    /// Calls so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order
    #[must_use]
    pub fn requests(&self) -> Vec<AuthorizationRequest> {
        self.requests.lock().map(|requests| requests.clone()).unwrap_or_default()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(MockOutcome::Approve)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.lock().map(|delay_ms| *delay_ms).unwrap_or(0))
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn authorize(
        &self,
        amount: Money,
        description: String,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentAuthorization>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(AuthorizationRequest {
                amount,
                description,
            });
        }
        let outcome = self.next_outcome();
        let delay = self.delay();

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match outcome {
                MockOutcome::Approve => Ok(PaymentAuthorization {
                    reference: PaymentReference::new(format!("pay_{}", Uuid::new_v4().simple())),
                    amount,
                }),
                MockOutcome::Decline(reason) => Err(PaymentGatewayError::Declined { reason }),
                MockOutcome::Cancel => Err(PaymentGatewayError::Cancelled),
                MockOutcome::Unavailable => Err(PaymentGatewayError::Unavailable("mock gateway offline".to_string())),
            }
        })
    }
}
