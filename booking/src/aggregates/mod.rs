//! Aggregate reducers for venue booking.
//!
//! - Checkout: saga coordinating re-validation, payment authorization,
//!   durable commit and background reconciliation

pub mod checkout;

pub use checkout::{
    CheckoutAction, CheckoutAttempt, CheckoutEnvironment, CheckoutPhase, CheckoutReducer, CheckoutRequest,
    CheckoutState, CheckoutTimeouts, CANCELLED_BY_USER, DEFAULT_RETAINED_ATTEMPTS,
};
