//! Application wiring.
//!
//! - [`VenueApp`] builds the checkout store, catalog cache and services over
//!   one storage collaborator and one payment collaborator
//! - Services are the entry points actors and operators call

mod coordinator;
mod services;

pub use coordinator::VenueApp;
pub use services::{CheckoutReceipt, CheckoutService, CheckoutStore, OrderError, OrderService};
