//! In-memory storage with failure injection, for tests and the demo binary.

use super::{StorageError, StorageResult, VenueStorage};
use crate::inventory::StockKey;
use crate::types::{
    Booking, BookingId, Event, EventId, Order, OrderId, OrderStatus, Product, ProductId, UserId, UserProfile,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    events: HashMap<EventId, Event>,
    bookings: Vec<Booking>,
    products: HashMap<ProductId, Product>,
    orders: Vec<Order>,
    users: HashMap<UserId, UserProfile>,
}

/// Lets `skip` calls through, then fails the next `fail` calls.
#[derive(Default)]
struct FailureBudget {
    skip: AtomicUsize,
    fail: AtomicUsize,
}

impl FailureBudget {
    fn arm(&self, skip: usize, fail: usize) {
        self.skip.store(skip, Ordering::SeqCst);
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if take_one(&self.skip) {
            return false;
        }
        take_one(&self.fail)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Storage backed by process memory
///
/// Every write is atomic per record. Failures can be injected per record
/// type to exercise partial-failure paths.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    booking_write_failures: FailureBudget,
    order_write_failures: FailureBudget,
    stock_failures: FailureBudget,
    booking_write_delay_ms: AtomicU64,
    counter_write_delay_ms: AtomicU64,
    user_writes: AtomicUsize,
    stock_decrements: AtomicUsize,
}

impl InMemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` booking inserts
    pub fn fail_next_booking_writes(&self, count: usize) {
        self.booking_write_failures.arm(0, count);
    }

    /// Let `successes` booking inserts through, then fail the next `count`
    pub fn fail_booking_writes_after(&self, successes: usize, count: usize) {
        self.booking_write_failures.arm(successes, count);
    }

    /// Fail the next `count` order inserts
    pub fn fail_next_order_writes(&self, count: usize) {
        self.order_write_failures.arm(0, count);
    }

    /// Fail the next `count` stock decrements
    pub fn fail_next_stock_decrements(&self, count: usize) {
        self.stock_failures.arm(0, count);
    }

    /// Make every call fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every booking insert
    pub fn delay_booking_writes(&self, delay: Duration) {
        self.booking_write_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Hold the next attendance counter write back by `delay`
    pub fn delay_next_counter_write(&self, delay: Duration) {
        self.counter_write_delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// User profile writes so far, including counter updates
    #[must_use]
    pub fn user_writes(&self) -> usize {
        self.user_writes.load(Ordering::SeqCst)
    }

    /// Successful stock decrements so far
    #[must_use]
    pub fn stock_decrements(&self) -> usize {
        self.stock_decrements.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("storage offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Unavailable(format!("injected {what} failure"))
}

impl VenueStorage for InMemoryStorage {
    fn load_event(&self, id: EventId) -> BoxFuture<'_, StorageResult<Event>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .read()
                .await
                .events
                .get(&id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("Event", id))
        })
    }

    fn list_events(&self) -> BoxFuture<'_, StorageResult<Vec<Event>>> {
        Box::pin(async move {
            self.check_available()?;
            let mut events: Vec<Event> = self.tables.read().await.events.values().cloned().collect();
            events.sort_by_key(|event| event.scheduled_at);
            Ok(events)
        })
    }

    fn save_event(&self, event: Event) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables.write().await.events.insert(event.id, event);
            Ok(())
        })
    }

    fn list_bookings(&self) -> BoxFuture<'_, StorageResult<Vec<Booking>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.tables.read().await.bookings.clone())
        })
    }

    fn list_event_bookings(&self, event_id: EventId) -> BoxFuture<'_, StorageResult<Vec<Booking>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .tables
                .read()
                .await
                .bookings
                .iter()
                .filter(|booking| booking.event_id == event_id)
                .cloned()
                .collect())
        })
    }

    fn list_user_bookings(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<Booking>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .tables
                .read()
                .await
                .bookings
                .iter()
                .filter(|booking| booking.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn load_booking(&self, id: BookingId) -> BoxFuture<'_, StorageResult<Booking>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .read()
                .await
                .bookings
                .iter()
                .find(|booking| booking.id == id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("Booking", id))
        })
    }

    fn create_booking(&self, booking: Booking) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let delay_ms = self.booking_write_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.check_available()?;
            if self.booking_write_failures.should_fail() {
                return Err(injected("booking write"));
            }

            let mut tables = self.tables.write().await;
            if tables.bookings.iter().any(|existing| existing.id == booking.id) {
                return Err(StorageError::Conflict(format!("Booking {} already exists", booking.id)));
            }
            tables.bookings.push(booking);
            Ok(())
        })
    }

    fn compare_and_set_attended(
        &self,
        id: BookingId,
        expected: bool,
        attended: bool,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        Box::pin(async move {
            self.check_available()?;
            let mut tables = self.tables.write().await;
            let booking = tables
                .bookings
                .iter_mut()
                .find(|booking| booking.id == id)
                .ok_or_else(|| StorageError::not_found("Booking", id))?;

            if booking.attended != expected {
                return Ok(false);
            }
            booking.attended = attended;
            Ok(true)
        })
    }

    fn delete_booking(&self, id: BookingId) -> BoxFuture<'_, StorageResult<Booking>> {
        Box::pin(async move {
            self.check_available()?;
            let mut tables = self.tables.write().await;
            let index = tables
                .bookings
                .iter()
                .position(|booking| booking.id == id)
                .ok_or_else(|| StorageError::not_found("Booking", id))?;
            Ok(tables.bookings.remove(index))
        })
    }

    fn load_product(&self, id: ProductId) -> BoxFuture<'_, StorageResult<Product>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .read()
                .await
                .products
                .get(&id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("Product", id))
        })
    }

    fn list_products(&self) -> BoxFuture<'_, StorageResult<Vec<Product>>> {
        Box::pin(async move {
            self.check_available()?;
            let mut products: Vec<Product> = self.tables.read().await.products.values().cloned().collect();
            products.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(products)
        })
    }

    fn save_product(&self, product: Product) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables.write().await.products.insert(product.id, product);
            Ok(())
        })
    }

    fn decrement_stock(&self, key: StockKey) -> BoxFuture<'_, StorageResult<u32>> {
        Box::pin(async move {
            self.check_available()?;
            if self.stock_failures.should_fail() {
                return Err(injected("stock decrement"));
            }

            let mut tables = self.tables.write().await;
            let product = tables
                .products
                .get_mut(&key.product_id)
                .ok_or_else(|| StorageError::not_found("Product", key.product_id))?;
            let stock = match key.variant_id {
                Some(variant_id) => {
                    &mut product
                        .variants
                        .iter_mut()
                        .find(|variant| variant.id == variant_id)
                        .ok_or_else(|| StorageError::not_found("Variant", variant_id))?
                        .stock
                },
                None => &mut product.stock,
            };

            *stock = stock
                .checked_sub(1)
                .ok_or_else(|| StorageError::Conflict(format!("{key} is out of stock")))?;
            self.stock_decrements.fetch_add(1, Ordering::SeqCst);
            Ok(*stock)
        })
    }

    fn create_order(&self, order: Order) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            if self.order_write_failures.should_fail() {
                return Err(injected("order write"));
            }

            let mut tables = self.tables.write().await;
            if tables.orders.iter().any(|existing| existing.id == order.id) {
                return Err(StorageError::Conflict(format!("Order {} already exists", order.id)));
            }
            tables.orders.push(order);
            Ok(())
        })
    }

    fn load_order(&self, id: OrderId) -> BoxFuture<'_, StorageResult<Order>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .read()
                .await
                .orders
                .iter()
                .find(|order| order.id == id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("Order", id))
        })
    }

    fn list_orders(&self) -> BoxFuture<'_, StorageResult<Vec<Order>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.tables.read().await.orders.clone())
        })
    }

    fn update_order_status(&self, id: OrderId, status: OrderStatus) -> BoxFuture<'_, StorageResult<Order>> {
        Box::pin(async move {
            self.check_available()?;
            let mut tables = self.tables.write().await;
            let order = tables
                .orders
                .iter_mut()
                .find(|order| order.id == id)
                .ok_or_else(|| StorageError::not_found("Order", id))?;
            order.status = status;
            Ok(order.clone())
        })
    }

    fn load_user(&self, id: UserId) -> BoxFuture<'_, StorageResult<UserProfile>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .read()
                .await
                .users
                .get(&id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("User", id))
        })
    }

    fn list_users(&self) -> BoxFuture<'_, StorageResult<Vec<UserProfile>>> {
        Box::pin(async move {
            self.check_available()?;
            let mut users: Vec<UserProfile> = self.tables.read().await.users.values().cloned().collect();
            users.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            Ok(users)
        })
    }

    fn save_user(&self, user: UserProfile) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables.write().await.users.insert(user.id, user);
            self.user_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn set_attendance_count(&self, id: UserId, count: u32) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let delay_ms = self.counter_write_delay_ms.swap(0, Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.check_available()?;
            let mut tables = self.tables.write().await;
            let user = tables
                .users
                .get_mut(&id)
                .ok_or_else(|| StorageError::not_found("User", id))?;
            user.attendance_count = count;
            self.user_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
