//! Durable storage collaborator.
//!
//! Writes are atomic per record and nothing more: a multi-row commit may
//! leave some rows written when a later one fails, and callers must report
//! that rather than assume a rollback.

use crate::inventory::StockKey;
use crate::types::{
    Booking, BookingId, Event, EventId, Order, OrderId, OrderStatus, Product, ProductId, UserId, UserProfile,
};
use futures::future::BoxFuture;
use thiserror::Error;

mod memory;

pub use memory::InMemoryStorage;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by the storage collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record with this id
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record type
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// The write conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached or refused the request
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Shorthand for [`StorageError::NotFound`]
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the error means the record does not exist
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Create/read/update/delete per record type
pub trait VenueStorage: Send + Sync {
    /// Load one event
    fn load_event(&self, id: EventId) -> BoxFuture<'_, StorageResult<Event>>;

    /// Every event
    fn list_events(&self) -> BoxFuture<'_, StorageResult<Vec<Event>>>;

    /// Insert or replace an event
    fn save_event(&self, event: Event) -> BoxFuture<'_, StorageResult<()>>;

    /// Every booking, in creation order
    fn list_bookings(&self) -> BoxFuture<'_, StorageResult<Vec<Booking>>>;

    /// Bookings of one event, in creation order
    fn list_event_bookings(&self, event_id: EventId) -> BoxFuture<'_, StorageResult<Vec<Booking>>>;

    /// Bookings owned by one user, in creation order
    fn list_user_bookings(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<Booking>>>;

    /// Load one booking
    fn load_booking(&self, id: BookingId) -> BoxFuture<'_, StorageResult<Booking>>;

    /// Insert a new booking
    fn create_booking(&self, booking: Booking) -> BoxFuture<'_, StorageResult<()>>;

    /// Set `attended` only if it currently equals `expected`
    ///
    /// Returns whether the write happened.
    fn compare_and_set_attended(
        &self,
        id: BookingId,
        expected: bool,
        attended: bool,
    ) -> BoxFuture<'_, StorageResult<bool>>;

    /// Delete a booking, returning the removed row
    fn delete_booking(&self, id: BookingId) -> BoxFuture<'_, StorageResult<Booking>>;

    /// Load one product
    fn load_product(&self, id: ProductId) -> BoxFuture<'_, StorageResult<Product>>;

    /// Every product
    fn list_products(&self) -> BoxFuture<'_, StorageResult<Vec<Product>>>;

    /// Insert or replace a product
    fn save_product(&self, product: Product) -> BoxFuture<'_, StorageResult<()>>;

    /// Remove one unit of stock, returning what is left
    ///
    /// Fails with [`StorageError::Conflict`] rather than going below zero.
    fn decrement_stock(&self, key: StockKey) -> BoxFuture<'_, StorageResult<u32>>;

    /// Insert a new order
    fn create_order(&self, order: Order) -> BoxFuture<'_, StorageResult<()>>;

    /// Load one order
    fn load_order(&self, id: OrderId) -> BoxFuture<'_, StorageResult<Order>>;

    /// Every order, in creation order
    fn list_orders(&self) -> BoxFuture<'_, StorageResult<Vec<Order>>>;

    /// Overwrite an order's status, returning the updated order
    fn update_order_status(&self, id: OrderId, status: OrderStatus) -> BoxFuture<'_, StorageResult<Order>>;

    /// Load one user profile
    fn load_user(&self, id: UserId) -> BoxFuture<'_, StorageResult<UserProfile>>;

    /// Every user profile
    fn list_users(&self) -> BoxFuture<'_, StorageResult<Vec<UserProfile>>>;

    /// Insert or replace a user profile
    fn save_user(&self, user: UserProfile) -> BoxFuture<'_, StorageResult<()>>;

    /// Overwrite a user's cached attendance counter
    fn set_attendance_count(&self, id: UserId, count: u32) -> BoxFuture<'_, StorageResult<()>>;
}
