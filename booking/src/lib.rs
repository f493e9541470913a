//! Venue Booking - reservation, checkout reconciliation and check-in
//!
//! Turns booking and shopping carts into durable records against finite
//! capacity, confirms payment before anything is written, and later marks
//! attendance exactly once per booking.
//!
//! # Architecture
//!
//! ```text
//!  EventCart / RetailCart ──► CheckoutService ──► Store<CheckoutReducer>
//!      (advisory clamps)                              │
//!                    ┌────────────────────────────────┼─────────────────────┐
//!                    ▼                                ▼                     ▼
//!          re-validate (storage)          authorize (gateway)      commit (storage)
//!                                                                         │
//!                                                     background: stock decrement + catalog refresh
//!
//!  ScanSession ──► CheckInEngine ──► storage (attended flag, recomputed counter)
//!                                          ▲
//!                    MembershipService ────┘ (eligibility reads the counter)
//! ```
//!
//! # Failure handling
//!
//! Everything before payment authorization is recoverable and shown inline.
//! A durable write that fails after authorization surfaces
//! [`CheckoutError::CommitFailedAfterPayment`] carrying the payment
//! reference. Background reconciliation failures are logged and counted only.
//!
//! # Concurrency
//!
//! Capacity checks at cart-edit time are advisory; checkout re-validates
//! against live inventory just before authorization. Two sessions can still
//! both pass validation before either commits; no reservation hold is taken.
//! Check-in flips attendance with a compare-and-set and always recomputes
//! the owner's counter, so racing operators cannot double count.

pub mod aggregates;
pub mod app;
pub mod cart;
pub mod catalog;
pub mod check_in;
pub mod config;
pub mod error;
pub mod inventory;
pub mod membership;
pub mod payment_gateway;
pub mod reconciliation;
pub mod scanner;
pub mod storage;
pub mod types;

pub use aggregates::{CheckoutAction, CheckoutPhase, CheckoutReducer, CheckoutState};
pub use app::{CheckoutReceipt, CheckoutService, OrderService, VenueApp};
pub use cart::{EventCart, RetailCart};
pub use check_in::{AttendanceOverride, CheckInEngine, CheckInError, CheckInOutcome};
pub use config::Config;
pub use error::{CheckoutError, ValidationError};
pub use membership::{MembershipBenefits, MembershipService};
pub use payment_gateway::{MockPaymentGateway, PaymentGateway};
pub use storage::{InMemoryStorage, StorageError, VenueStorage};
pub use types::*;
