//! End-to-end checkout tests against in-memory collaborators.
//!
//! Each test wires a [`VenueApp`] over [`InMemoryStorage`] and a scripted
//! [`MockPaymentGateway`], then drives the checkout service the way a
//! session would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;
use venue_booking::aggregates::CheckoutPhase;
use venue_booking::inventory::{EventSelection, StockKey};
use venue_booking::{
    BuyerInfo, CapacityPool, CheckoutError, Config, Event, ExtraKey, InMemoryStorage, MockPaymentGateway, Money,
    OrderStatus, Product, SessionId, TicketCategory, UserProfile, ValidationError, Variant, VenueApp, VenueStorage,
};
use venue_core::environment::Clock;
use venue_testing::{init_test_tracing, test_clock};

struct Fixture {
    app: VenueApp,
    storage: Arc<InMemoryStorage>,
    gateway: Arc<MockPaymentGateway>,
    event: Event,
    shirt: Product,
    small: ExtraKey,
    sam: UserProfile,
    alex: UserProfile,
}

fn test_config() -> Config {
    Config::from_lookup(|key| match key {
        "VENUE_AUTHORIZATION_TIMEOUT_SECS" | "VENUE_VALIDATION_TIMEOUT_SECS" | "VENUE_COMMIT_TIMEOUT_SECS" => {
            Some("1".to_string())
        },
        "VENUE_RECONCILE_INITIAL_DELAY_MS" | "VENUE_RECONCILE_MAX_DELAY_MS" => Some("1".to_string()),
        "VENUE_RECONCILE_MAX_RETRIES" => Some("1".to_string()),
        _ => None,
    })
}

async fn fixture() -> Fixture {
    init_test_tracing();
    let clock = test_clock();
    let year = clock.current_year();
    let storage = Arc::new(InMemoryStorage::new());
    let gateway = MockPaymentGateway::shared();

    let shirt = Product::new("Club T-Shirt", Money::from_pounds(15), 0)
        .extra_eligible()
        .with_variant(Variant::new("S", Money::from_pounds(15), 1))
        .with_variant(Variant::new("M", Money::from_pounds(15), 0));
    let mut event = Event::new(
        "Friday Session",
        clock.now(),
        CapacityPool::new(2, Money::from_pounds(25)),
        CapacityPool::new(4, Money::from_pounds(35)),
    );
    let extra = event.add_extra(shirt.id);
    let small = ExtraKey::variant(extra, shirt.variants[0].id);
    let sam = UserProfile::new("Sam Okafor").with_waiver(year);
    let alex = UserProfile::new("Alex Rivera").with_waiver(year).active_member();

    storage.save_product(shirt.clone()).await.unwrap();
    storage.save_event(event.clone()).await.unwrap();
    storage.save_user(sam.clone()).await.unwrap();
    storage.save_user(alex.clone()).await.unwrap();

    let app = VenueApp::new(test_config(), storage.clone(), gateway.clone(), Arc::new(clock));
    Fixture {
        app,
        storage,
        gateway,
        event,
        shirt,
        small,
        sam,
        alex,
    }
}

async fn wait_for_reconciliation(fixture: &Fixture, attempt_id: venue_booking::AttemptId) -> venue_booking::reconciliation::ReconciliationReport {
    for _ in 0..200 {
        if let Some(report) = fixture
            .app
            .checkout
            .attempt(attempt_id)
            .await
            .and_then(|attempt| attempt.reconciliation)
        {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("reconciliation did not finish");
}

#[tokio::test]
async fn test_booking_to_capacity_then_next_cart_clamps() {
    let fixture = fixture().await;
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    assert_eq!(cart.set_quantity(TicketCategory::WalkOn, 2), 2);

    let receipt = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await
        .unwrap();

    assert!(cart.is_empty());
    assert_eq!(receipt.total, Money::from_pounds(50));
    let bookings = fixture.storage.list_event_bookings(fixture.event.id).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].quantity, 2);
    assert_eq!(bookings[0].total, Money::from_pounds(50));
    assert_eq!(bookings[0].payment_reference, receipt.payment_reference);
    assert_eq!(bookings[0].holder_name, "Sam Okafor");

    let mut next = fixture.app.event_cart(fixture.event.id).await.unwrap();
    assert_eq!(next.set_quantity(TicketCategory::WalkOn, 1), 0);
}

#[tokio::test]
async fn test_member_pays_discounted_ticket_total() {
    let fixture = fixture().await;
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::WalkOn, 2);

    let receipt = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.alex), &mut cart)
        .await
        .unwrap();

    assert_eq!(receipt.total, Money::from_pounds(45));
    assert_eq!(fixture.gateway.requests()[0].amount, Money::from_pounds(45));
}

#[tokio::test]
async fn test_multi_category_cart_writes_one_row_per_category() {
    let fixture = fixture().await;
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::WalkOn, 1);
    cart.set_quantity(TicketCategory::Rental, 2);
    cart.increment_extra(fixture.small);

    let receipt = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.alex), &mut cart)
        .await
        .unwrap();

    let bookings = fixture.storage.list_event_bookings(fixture.event.id).await.unwrap();
    assert_eq!(bookings.len(), 2);
    assert!(bookings.iter().all(|booking| booking.payment_reference == receipt.payment_reference));
    let walk_on = bookings.iter().find(|b| b.category == TicketCategory::WalkOn).unwrap();
    let rental = bookings.iter().find(|b| b.category == TicketCategory::Rental).unwrap();
    assert_eq!(walk_on.extras.get(&fixture.small), Some(&1));
    assert!(rental.extras.is_empty());
    assert_eq!(walk_on.total.saturating_add(rental.total), receipt.total);
    // (25 + 70) × 0.9 + 15
    assert_eq!(receipt.total, Money::from_pence(10_050));

    let report = wait_for_reconciliation(&fixture, receipt.attempt_id).await;
    assert!(report.is_clean());
    let shirt = fixture.storage.load_product(fixture.shirt.id).await.unwrap();
    assert_eq!(shirt.variants[0].stock, 0);
    assert_eq!(fixture.app.catalog.product(fixture.shirt.id).await.unwrap().variants[0].stock, 0);
}

#[tokio::test]
async fn test_capacity_taken_mid_session_is_rejected_before_payment() {
    let fixture = fixture().await;
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::WalkOn, 2);

    fixture
        .app
        .checkout
        .add_booking_as_operator(
            &fixture.alex,
            EventSelection::new(fixture.event.id).with_tickets(TicketCategory::WalkOn, 1),
        )
        .await
        .unwrap();

    let result = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await;

    assert_eq!(
        result,
        Err(CheckoutError::CapacityExceeded {
            item: "Walk-on tickets".to_string(),
            requested: 2,
            available: 1,
        })
    );
    assert_eq!(fixture.gateway.calls(), 0);
    assert_eq!(cart.quantity(TicketCategory::WalkOn), 2);
    assert!(fixture.app.refresh_event_cart(&mut cart).await.unwrap());
    assert_eq!(cart.quantity(TicketCategory::WalkOn), 1);
}

#[tokio::test]
async fn test_declined_payment_leaves_no_rows_and_frees_session() {
    let fixture = fixture().await;
    let session = SessionId::new();
    fixture.gateway.decline_next("insufficient funds");
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);

    let declined = fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await;

    assert!(matches!(declined, Err(CheckoutError::AuthorizationFailedOrCancelled { .. })));
    assert!(fixture.storage.list_bookings().await.unwrap().is_empty());
    assert_eq!(fixture.app.checkout.active_attempt(session).await, None);

    let retried = fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await;
    assert!(retried.is_ok());
}

#[tokio::test]
async fn test_commit_failure_after_payment_reports_reference() {
    let fixture = fixture().await;
    fixture.storage.fail_next_booking_writes(1);
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::WalkOn, 1);

    let error = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await
        .unwrap_err();

    let reference = error.payment_reference().cloned().expect("reference on paid failure");
    assert!(error.is_paid_but_uncommitted());
    assert!(error.to_string().contains(reference.as_str()));
    assert!(fixture.storage.list_bookings().await.unwrap().is_empty());
    assert!(!cart.is_empty());
}

#[tokio::test]
async fn test_partial_commit_lists_rows_written() {
    let fixture = fixture().await;
    fixture.storage.fail_booking_writes_after(1, 1);
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::WalkOn, 1);
    cart.set_quantity(TicketCategory::Rental, 1);

    let error = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await
        .unwrap_err();

    let CheckoutError::CommitFailedAfterPayment { committed, .. } = error else {
        panic!("expected a paid-but-uncommitted error, got {error:?}");
    };
    assert_eq!(committed.len(), 1);
    assert_eq!(fixture.storage.list_bookings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_checkout_in_same_session_is_in_progress() {
    let fixture = Arc::new(fixture().await);
    fixture.gateway.set_delay(Duration::from_millis(300));
    let session = SessionId::new();

    let background = {
        let fixture = Arc::clone(&fixture);
        tokio::spawn(async move {
            let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
            cart.set_quantity(TicketCategory::Rental, 1);
            fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await
        })
    };
    while fixture.app.checkout.active_attempt(session).await.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);
    let second = fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await;

    assert_eq!(second, Err(CheckoutError::InProgress));
    assert!(background.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancel_while_awaiting_authorization() {
    let fixture = Arc::new(fixture().await);
    fixture.gateway.set_delay(Duration::from_millis(200));
    fixture.gateway.cancel_next();
    let session = SessionId::new();

    let background = {
        let fixture = Arc::clone(&fixture);
        tokio::spawn(async move {
            let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
            cart.set_quantity(TicketCategory::Rental, 1);
            fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await
        })
    };
    let attempt_id = loop {
        if let Some(attempt_id) = fixture.app.checkout.active_attempt(session).await {
            break attempt_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    while fixture.app.checkout.attempt(attempt_id).await.unwrap().phase != CheckoutPhase::AwaitingAuthorization {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fixture.app.checkout.cancel(attempt_id).await.unwrap();

    assert!(matches!(
        background.await.unwrap(),
        Err(CheckoutError::AuthorizationFailedOrCancelled { .. })
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fixture.storage.list_bookings().await.unwrap().is_empty());
    assert!(matches!(
        fixture.app.checkout.cancel(attempt_id).await,
        Err(CheckoutError::NotCancellable { .. })
    ));
}

#[tokio::test]
async fn test_authorization_after_cancel_request_settles_and_refuses_cancel() {
    let fixture = fixture().await;
    fixture.gateway.set_delay(Duration::from_millis(100));
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);
    let session = SessionId::new();

    let checkout = fixture.app.checkout.clone();
    let sam = fixture.sam.clone();
    let pending = tokio::spawn(async move { checkout.checkout_event(session, Some(&sam), &mut cart).await });
    let attempt_id = loop {
        if let Some(attempt_id) = fixture.app.checkout.active_attempt(session).await {
            if fixture.app.checkout.attempt(attempt_id).await.unwrap().phase == CheckoutPhase::AwaitingAuthorization {
                break attempt_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    let cancelled = fixture.app.checkout.cancel(attempt_id).await;
    let receipt = pending.await.unwrap().unwrap();

    assert_eq!(
        cancelled,
        Err(CheckoutError::NotCancellable {
            reason: "payment already authorized".to_string(),
        })
    );
    assert_eq!(receipt.attempt_id, attempt_id);
    let bookings = fixture.storage.list_bookings().await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].payment_reference, receipt.payment_reference);

    wait_for_reconciliation(&fixture, attempt_id).await;
    let attempt = fixture.app.checkout.attempt(attempt_id).await.unwrap();
    assert!(attempt.cancelled);
    assert_eq!(attempt.phase, CheckoutPhase::Settled);
}

#[tokio::test]
async fn test_shutdown_lets_inflight_authorization_commit() {
    let fixture = Arc::new(fixture().await);
    fixture.gateway.set_delay(Duration::from_millis(200));
    let session = SessionId::new();

    let background = {
        let fixture = Arc::clone(&fixture);
        tokio::spawn(async move {
            let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
            cart.set_quantity(TicketCategory::Rental, 1);
            fixture.app.checkout.checkout_event(session, Some(&fixture.sam), &mut cart).await
        })
    };
    let attempt_id = loop {
        if let Some(attempt_id) = fixture.app.checkout.active_attempt(session).await {
            if fixture.app.checkout.attempt(attempt_id).await.unwrap().phase == CheckoutPhase::AwaitingAuthorization {
                break attempt_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };

    fixture.app.checkout.shutdown(Duration::from_secs(2)).await.unwrap();

    let receipt = background.await.unwrap().unwrap();
    assert_eq!(fixture.gateway.calls(), 1);
    let bookings = fixture.storage.list_bookings().await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].payment_reference, receipt.payment_reference);
    let attempt = fixture.app.checkout.attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.phase, CheckoutPhase::Settled);
    assert!(attempt.reconciliation.is_some());

    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);
    let refused = fixture.app.checkout.checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart).await;
    assert!(matches!(refused, Err(CheckoutError::Runtime(_))));
}

#[tokio::test]
async fn test_authorization_timeout_fails_without_rows() {
    let fixture = fixture().await;
    fixture.gateway.set_delay(Duration::from_millis(1500));
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);

    let result = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await;

    let Err(CheckoutError::AuthorizationFailedOrCancelled { reason }) = result else {
        panic!("expected authorization failure, got {result:?}");
    };
    assert!(reason.contains("timed out"));
    assert!(fixture.storage.list_bookings().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_operator_booking_skips_payment() {
    let fixture = fixture().await;

    let receipt = fixture
        .app
        .checkout
        .add_booking_as_operator(
            &fixture.sam,
            EventSelection::new(fixture.event.id).with_tickets(TicketCategory::Rental, 3),
        )
        .await
        .unwrap();

    assert!(receipt.payment_reference.is_synthetic());
    assert_eq!(fixture.gateway.calls(), 0);
    let booking = fixture.storage.load_booking(receipt.bookings[0]).await.unwrap();
    assert_eq!(booking.user_id, fixture.sam.id);
    assert_eq!(booking.quantity, 3);
}

#[tokio::test]
async fn test_guard_rejects_before_any_collaborator_call() {
    let fixture = fixture().await;
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    let checkout = &fixture.app.checkout;

    assert_eq!(
        checkout.checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart).await,
        Err(ValidationError::EmptyCart.into())
    );

    cart.increment_extra(fixture.small);
    assert_eq!(
        checkout.checkout_event(SessionId::new(), None, &mut cart).await,
        Err(ValidationError::NotAuthenticated.into())
    );
    let lapsed = UserProfile::new("Lapsed").with_waiver(2025);
    assert_eq!(
        checkout.checkout_event(SessionId::new(), Some(&lapsed), &mut cart).await,
        Err(ValidationError::WaiverRequired { year: 2026 }.into())
    );
    assert_eq!(
        checkout.checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart).await,
        Err(ValidationError::NoTickets.into())
    );
    assert_eq!(fixture.gateway.calls(), 0);
}

#[tokio::test]
async fn test_retail_order_commits_pending_and_decrements_stock() {
    let fixture = fixture().await;
    let boots = Product::new("Boots", Money::from_pounds(40), 3);
    fixture.storage.save_product(boots.clone()).await.unwrap();
    fixture.app.catalog.refresh().await.unwrap();
    let mut cart = fixture.app.retail_cart().await.unwrap();
    cart.set_item_quantity(StockKey::product(boots.id), 2);
    let buyer = BuyerInfo {
        user_id: fixture.sam.id,
        name: "Sam Okafor".to_string(),
        email: "sam@example.com".to_string(),
        shipping_address: Some("1 High Street".to_string()),
    };

    let receipt = fixture
        .app
        .checkout
        .checkout_retail(SessionId::new(), Some(&fixture.sam), &mut cart, buyer)
        .await
        .unwrap();

    assert_eq!(receipt.total, Money::from_pence(8_395));
    let order = fixture.storage.load_order(receipt.order.unwrap()).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_reference, receipt.payment_reference);

    wait_for_reconciliation(&fixture, receipt.attempt_id).await;
    assert_eq!(fixture.storage.load_product(boots.id).await.unwrap().stock, 1);
}

#[tokio::test]
async fn test_reconciliation_failures_never_reach_the_actor() {
    let fixture = fixture().await;
    fixture.storage.fail_next_stock_decrements(10);
    let mut cart = fixture.app.event_cart(fixture.event.id).await.unwrap();
    cart.set_quantity(TicketCategory::Rental, 1);
    cart.increment_extra(fixture.small);

    let receipt = fixture
        .app
        .checkout
        .checkout_event(SessionId::new(), Some(&fixture.sam), &mut cart)
        .await
        .unwrap();

    let report = wait_for_reconciliation(&fixture, receipt.attempt_id).await;
    assert_eq!(report.failures.len(), 1);
    let attempt = fixture.app.checkout.attempt(receipt.attempt_id).await.unwrap();
    assert_eq!(attempt.phase, CheckoutPhase::Settled);
    assert_eq!(fixture.storage.list_bookings().await.unwrap().len(), 1);
}
