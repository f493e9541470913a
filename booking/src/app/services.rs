//! Services - the entry points actors and operators call.
//!
//! [`CheckoutService`] drives the checkout store:
//! 1. Guard the cart locally (sign-in, waiver, non-zero total)
//! 2. Send `StartCheckout` and wait for that attempt's outcome only
//! 3. Map the outcome onto [`CheckoutError`] or a [`CheckoutReceipt`]
//! 4. Clear the cart on success
//!
//! Background reconciliation keeps running after the caller has its answer.

use crate::aggregates::{
    CheckoutAction, CheckoutAttempt, CheckoutEnvironment, CheckoutReducer, CheckoutRequest, CheckoutState,
    CANCELLED_BY_USER,
};
use crate::cart::{checkout_guard, EventCart, RetailCart};
use crate::error::{CheckoutError, ValidationError};
use crate::inventory::EventSelection;
use crate::membership::MembershipBenefits;
use crate::storage::{StorageError, VenueStorage};
use crate::types::{AttemptId, BookingId, BuyerInfo, Money, Order, OrderId, OrderStatus, PaymentReference, SessionId, UserProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use venue_core::environment::Clock;
use venue_runtime::{Store, StoreError};

/// Store hosting the checkout saga
pub type CheckoutStore = Store<CheckoutState, CheckoutAction, CheckoutEnvironment, CheckoutReducer>;

/// Headroom on top of the collaborator deadlines before a caller gives up
const WAIT_SLACK: Duration = Duration::from_secs(5);

/// What a settled checkout produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    /// Attempt that settled
    pub attempt_id: AttemptId,
    /// Reference recorded on every row
    pub payment_reference: PaymentReference,
    /// Amount charged
    pub total: Money,
    /// Booking rows written, in category order
    pub bookings: Vec<BookingId>,
    /// Retail order written
    pub order: Option<OrderId>,
}

/// Checkout entry points
#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<CheckoutStore>,
    clock: Arc<dyn Clock>,
    wait_timeout: Duration,
}

impl CheckoutService {
    /// Create a checkout service over a store
    #[must_use]
    pub fn new(store: Arc<CheckoutStore>, clock: Arc<dyn Clock>, collaborator_deadlines: Duration) -> Self {
        Self {
            store,
            clock,
            wait_timeout: collaborator_deadlines + WAIT_SLACK,
        }
    }

    /// Check out an event cart and clear it on success
    ///
    /// # Errors
    ///
    /// Any [`CheckoutError`]; only [`CheckoutError::CommitFailedAfterPayment`]
    /// means money moved. The cart is left untouched on error.
    #[tracing::instrument(skip(self, actor, cart), fields(event_id = %cart.event().id))]
    pub async fn checkout_event(
        &self,
        session_id: SessionId,
        actor: Option<&UserProfile>,
        cart: &mut EventCart,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        let membership_active = actor.is_some_and(|actor| MembershipBenefits::for_profile(actor).discount_active);
        let actor = checkout_guard(actor, cart.compute_total(membership_active), self.clock.current_year())?;
        if !cart.has_tickets() {
            return Err(ValidationError::NoTickets.into());
        }

        let receipt = self
            .run(
                session_id,
                actor.clone(),
                CheckoutRequest::EventBooking {
                    selection: cart.selection(),
                },
            )
            .await?;
        cart.clear();
        Ok(receipt)
    }

    /// Book on behalf of `holder` without taking payment
    ///
    /// A synthetic payment reference is recorded on the rows.
    ///
    /// # Errors
    ///
    /// Any pre-payment [`CheckoutError`], or
    /// [`CheckoutError::CommitFailedAfterPayment`] if the write fails.
    #[tracing::instrument(skip(self, holder, selection), fields(user_id = %holder.id, event_id = %selection.event_id))]
    pub async fn add_booking_as_operator(
        &self,
        holder: &UserProfile,
        selection: EventSelection,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        self.run(
            SessionId::new(),
            holder.clone(),
            CheckoutRequest::OperatorBooking { selection },
        )
        .await
    }

    /// Check out a retail cart and clear it on success
    ///
    /// # Errors
    ///
    /// As [`CheckoutService::checkout_event`].
    #[tracing::instrument(skip(self, actor, cart, buyer))]
    pub async fn checkout_retail(
        &self,
        session_id: SessionId,
        actor: Option<&UserProfile>,
        cart: &mut RetailCart,
        buyer: BuyerInfo,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        let actor = checkout_guard(actor, cart.compute_total(), self.clock.current_year())?;

        let receipt = self
            .run(
                session_id,
                actor.clone(),
                CheckoutRequest::RetailOrder {
                    selection: cart.selection(),
                    buyer,
                },
            )
            .await?;
        cart.clear();
        Ok(receipt)
    }

    /// Abandon an attempt that has not been authorized yet
    ///
    /// While an authorization request is out, the gateway's answer decides:
    /// this returns once the gateway has declined (cancelled, nothing charged)
    /// or authorized (refused, the booking is committed and the checkout
    /// caller gets its receipt).
    ///
    /// # Errors
    ///
    /// [`CheckoutError::NotCancellable`] once payment is authorized or the
    /// attempt has finished.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, attempt_id: AttemptId) -> Result<(), CheckoutError> {
        let answer = self
            .store
            .send_and_wait_for(
                CheckoutAction::CancelCheckout { attempt_id },
                move |action| action.is_cancel_answer_for(attempt_id),
                self.wait_timeout,
            )
            .await?;

        match answer {
            CheckoutAction::CheckoutCancelled { .. } => Ok(()),
            CheckoutAction::CancelRefused { reason, .. } => Err(CheckoutError::NotCancellable { reason }),
            other => Err(CheckoutError::Runtime(format!("unexpected answer to cancel: {other:?}"))),
        }
    }

    /// Inspect an attempt
    pub async fn attempt(&self, attempt_id: AttemptId) -> Option<CheckoutAttempt> {
        self.store.state(|state| state.attempt(&attempt_id).cloned()).await
    }

    /// Attempt currently holding `session_id`
    pub async fn active_attempt(&self, session_id: SessionId) -> Option<AttemptId> {
        self.store.state(|state| state.active_attempt(&session_id)).await
    }

    /// Stop accepting checkouts and let running effects drain
    ///
    /// # Errors
    ///
    /// [`StoreError::ShutdownTimeout`] if effects are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        self.store.shutdown(timeout).await
    }

    async fn run(
        &self,
        session_id: SessionId,
        actor: UserProfile,
        request: CheckoutRequest,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        let attempt_id = AttemptId::new();
        let outcome = self
            .store
            .send_and_wait_for(
                CheckoutAction::StartCheckout {
                    attempt_id,
                    session_id,
                    actor,
                    request,
                },
                move |action| action.is_outcome_for(attempt_id),
                self.wait_timeout,
            )
            .await?;

        match outcome {
            CheckoutAction::CheckoutCommitted {
                payment_reference,
                total,
                bookings,
                order,
                ..
            } => Ok(CheckoutReceipt {
                attempt_id,
                payment_reference,
                total,
                bookings,
                order,
            }),
            CheckoutAction::CheckoutRejected { error, .. } => Err(error),
            CheckoutAction::AuthorizationFailed { error, .. } => {
                // Reduced before it was broadcast, so the flag is current.
                let cancelled = self.attempt(attempt_id).await.is_some_and(|attempt| attempt.cancelled);
                Err(CheckoutError::AuthorizationFailedOrCancelled {
                    reason: if cancelled { CANCELLED_BY_USER.to_string() } else { error.to_string() },
                })
            },
            CheckoutAction::CommitFailed {
                payment_reference,
                reason,
                committed,
                ..
            } => Err(CheckoutError::CommitFailedAfterPayment {
                payment_reference,
                reason,
                committed,
            }),
            CheckoutAction::CheckoutCancelled { .. } => Err(CheckoutError::AuthorizationFailedOrCancelled {
                reason: CANCELLED_BY_USER.to_string(),
            }),
            other => Err(CheckoutError::Runtime(format!("unexpected checkout outcome: {other:?}"))),
        }
    }
}

/// Errors advancing retail orders
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// The status machine does not allow the move
    #[error("Order cannot move from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// Storage collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Operator fulfillment of retail orders
#[derive(Clone)]
pub struct OrderService {
    storage: Arc<dyn VenueStorage>,
}

impl OrderService {
    /// Create an order service
    #[must_use]
    pub fn new(storage: Arc<dyn VenueStorage>) -> Self {
        Self { storage }
    }

    /// Move an order along `pending → processing → dispatched → completed`,
    /// or cancel it from any non-terminal status
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] for any other move.
    #[tracing::instrument(skip(self))]
    pub async fn advance_order(&self, order_id: OrderId, next: OrderStatus) -> Result<Order, OrderError> {
        let order = self.storage.load_order(order_id).await?;
        if !order.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: order.status,
                to: next,
            });
        }

        let order = self.storage.update_order_status(order_id, next).await?;
        tracing::info!(order_id = %order_id, status = %next, "Order advanced");
        Ok(order)
    }

    /// Every order, oldest first
    ///
    /// # Errors
    ///
    /// [`OrderError::Storage`] if listing fails.
    pub async fn orders(&self) -> Result<Vec<Order>, OrderError> {
        Ok(self.storage.list_orders().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{OrderLineItem, ProductId, UserId};
    use venue_testing::test_clock;

    async fn stored_order(storage: &InMemoryStorage) -> Order {
        let order = Order {
            id: OrderId::new(),
            buyer: BuyerInfo {
                user_id: UserId::new(),
                name: "Jo Park".to_string(),
                email: "jo@example.com".to_string(),
                shipping_address: None,
            },
            items: vec![OrderLineItem {
                product_id: ProductId::new(),
                variant_id: None,
                name: "Chalk".to_string(),
                unit_price: Money::from_pence(350),
                quantity: 2,
            }],
            shipping_fee: Money::ZERO,
            total: Money::from_pence(700),
            status: OrderStatus::Pending,
            payment_reference: PaymentReference::new("pay_order"),
            created_at: test_clock().now(),
        };
        storage.create_order(order.clone()).await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_orders_advance_in_sequence() {
        let storage = Arc::new(InMemoryStorage::new());
        let order = stored_order(&storage).await;
        let service = OrderService::new(storage);

        for next in [OrderStatus::Processing, OrderStatus::Dispatched, OrderStatus::Completed] {
            assert_eq!(service.advance_order(order.id, next).await.unwrap().status, next);
        }
        assert_eq!(
            service.advance_order(order.id, OrderStatus::Cancelled).await,
            Err(OrderError::InvalidTransition {
                from: OrderStatus::Completed,
                to: OrderStatus::Cancelled,
            })
        );
    }

    #[tokio::test]
    async fn test_orders_cannot_skip_steps() {
        let storage = Arc::new(InMemoryStorage::new());
        let order = stored_order(&storage).await;
        let service = OrderService::new(storage);

        let result = service.advance_order(order.id, OrderStatus::Dispatched).await;

        assert!(matches!(result, Err(OrderError::InvalidTransition { .. })));
        assert_eq!(service.advance_order(order.id, OrderStatus::Cancelled).await.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(service.orders().await.unwrap().len(), 1);
    }
}
