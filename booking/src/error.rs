//! Checkout error taxonomy.
//!
//! Everything raised before payment authorization is recoverable and is shown
//! to the actor inline. [`CheckoutError::CommitFailedAfterPayment`] is the
//! one case where money has moved without a record; its message carries the
//! payment reference so a human can reconcile.

use crate::inventory::InventoryError;
use crate::types::{BookingId, EventId, PaymentReference};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use venue_runtime::StoreError;

/// Bad input caught before any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// No signed-in actor
    #[error("Sign in to check out")]
    NotAuthenticated,

    /// Waiver missing for the current calendar year
    #[error("A liability waiver for {year} is required before booking")]
    WaiverRequired {
        /// Year that needs a waiver
        year: i32,
    },

    /// Nothing to pay for
    #[error("Your cart is empty")]
    EmptyCart,

    /// Event carts need a ticket for extras to attach to
    #[error("Add at least one ticket; extras are sold with a ticket")]
    NoTickets,

    /// The event no longer exists
    #[error("Event {0} is no longer available")]
    UnknownEvent(EventId),

    /// A cart line names something no longer sold
    #[error("{0}")]
    UnknownItem(String),
}

/// Errors surfaced by checkout
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutError {
    /// Input rejected before any side effect
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Re-validation against live inventory failed; nothing was charged
    #[error("Not enough {item} left: requested {requested}, only {available} available")]
    CapacityExceeded {
        /// What ran out
        item: String,
        /// Units requested
        requested: u32,
        /// Units remaining
        available: u32,
    },

    /// Payment declined, cancelled or timed out; nothing was charged
    #[error("Payment was not completed: {reason}")]
    AuthorizationFailedOrCancelled {
        /// Gateway or user reason
        reason: String,
    },

    /// Payment captured but the durable write failed
    #[error(
        "Payment captured (reference {payment_reference}) but the booking could not be saved: {reason}. \
         Please contact support and quote the payment reference."
    )]
    CommitFailedAfterPayment {
        /// Reference of the captured payment
        payment_reference: PaymentReference,
        /// Why the write failed
        reason: String,
        /// Rows that were written before the failure
        committed: Vec<BookingId>,
    },

    /// The session already has a checkout awaiting its outcome
    #[error("A checkout is already in progress for this session")]
    InProgress,

    /// Cancellation arrived after authorization or after the outcome
    #[error("Checkout can no longer be cancelled: {reason}")]
    NotCancellable {
        /// Why
        reason: String,
    },

    /// A collaborator failed before payment; nothing was charged
    #[error("Checkout is temporarily unavailable: {0}")]
    Unavailable(String),

    /// The runtime hosting checkout failed
    #[error("Checkout runtime error: {0}")]
    Runtime(String),
}

impl CheckoutError {
    /// Whether money moved without a matching record
    #[must_use]
    pub const fn is_paid_but_uncommitted(&self) -> bool {
        matches!(self, Self::CommitFailedAfterPayment { .. })
    }

    /// Payment reference to quote to support, when one exists
    #[must_use]
    pub const fn payment_reference(&self) -> Option<&PaymentReference> {
        match self {
            Self::CommitFailedAfterPayment { payment_reference, .. } => Some(payment_reference),
            _ => None,
        }
    }
}

impl From<InventoryError> for CheckoutError {
    fn from(error: InventoryError) -> Self {
        match error {
            InventoryError::CapacityExceeded {
                item,
                requested,
                available,
            } => Self::CapacityExceeded {
                item,
                requested,
                available,
            },
            other => Self::Validation(ValidationError::UnknownItem(other.to_string())),
        }
    }
}

impl From<StoreError> for CheckoutError {
    fn from(error: StoreError) -> Self {
        Self::Runtime(error.to_string())
    }
}
