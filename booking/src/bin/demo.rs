//! Venue Booking Demo
//!
//! Walks the booking lifecycle against in-memory collaborators:
//! - Capacity reached, then clamped for the next actor
//! - Member discount and variant extras
//! - Check-in twice, then attendance reconciliation
//! - Payment captured but commit failed
//! - Retail order fulfillment
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin venue-demo
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use venue_booking::{
    BuyerInfo, CapacityPool, CheckInOutcome, Config, Event, ExtraKey, InMemoryStorage, MockPaymentGateway, Money,
    OrderStatus, Product, SessionId, TicketCategory, UserProfile, Variant, VenueApp, VenueStorage,
    inventory::StockKey,
};
use venue_core::environment::{Clock, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("\n🎟️  ============================================");
    println!("   Venue Booking - Live Demo");
    println!("============================================\n");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let year = clock.current_year();
    let storage = Arc::new(InMemoryStorage::new());
    let gateway = MockPaymentGateway::shared();

    // ========== Seed ==========

    println!("⚙️  Seeding venue...");
    let shirt = Product::new("Club T-Shirt", Money::from_pounds(15), 0)
        .extra_eligible()
        .with_variant(Variant::new("S", Money::from_pounds(15), 1))
        .with_variant(Variant::new("M", Money::from_pounds(15), 0));
    let chalk = Product::new("Chalk", Money::from_pence(350), 20).pickup_only();
    let mut event = Event::new(
        "Friday Session",
        clock.now() + chrono::Duration::days(3),
        CapacityPool::new(2, Money::from_pounds(25)),
        CapacityPool::new(4, Money::from_pounds(35)),
    );
    let shirt_extra = event.add_extra(shirt.id);
    let small = ExtraKey::variant(shirt_extra, shirt.variants[0].id);
    let medium = ExtraKey::variant(shirt_extra, shirt.variants[1].id);

    let sam = UserProfile::new("Sam Okafor").with_waiver(year);
    let alex = UserProfile::new("Alex Rivera").with_waiver(year).active_member();

    storage.save_product(shirt.clone()).await?;
    storage.save_product(chalk.clone()).await?;
    storage.save_event(event.clone()).await?;
    storage.save_user(sam.clone()).await?;
    storage.save_user(alex.clone()).await?;

    let app = VenueApp::new(config, storage.clone(), gateway.clone(), Arc::clone(&clock));
    println!("✓ {} with {} walk-on and {} rental slots\n", event.name, event.walk_on.capacity, event.rental.capacity);

    // ========== Scenario 1: capacity reached ==========

    println!("1️⃣  Sam books both walk-on slots");
    let mut cart = app.event_cart(event.id).await?;
    cart.set_quantity(TicketCategory::WalkOn, 2);
    println!("   Cart: {} = {}", cart.description(), cart.compute_total(false));
    let receipt = app.checkout.checkout_event(SessionId::new(), Some(&sam), &mut cart).await?;
    println!("   ✓ Settled {} booking(s), reference {}, charged {}", receipt.bookings.len(), receipt.payment_reference, receipt.total);

    let mut cart = app.event_cart(event.id).await?;
    let clamped = cart.set_quantity(TicketCategory::WalkOn, 1);
    println!("   Next actor asks for 1 walk-on slot, cart holds {clamped}\n");

    // ========== Scenario 2: member discount and variant extras ==========

    println!("2️⃣  Alex (member) books 2 rentals with a shirt");
    cart.set_quantity(TicketCategory::Rental, 2);
    println!("   Medium shirt (out of stock): {}", cart.increment_extra(medium));
    println!("   Small shirt: {}", cart.increment_extra(small));
    println!("   Small shirt again: {}", cart.increment_extra(small));
    let breakdown = cart.breakdown(true);
    println!(
        "   Tickets {} - member discount {} + extras {} = {}",
        breakdown.ticket_subtotal,
        breakdown.discount(),
        breakdown.extras_total,
        breakdown.total
    );
    let receipt = app.checkout.checkout_event(SessionId::new(), Some(&alex), &mut cart).await?;
    println!("   ✓ Charged {} ({})", receipt.total, receipt.payment_reference);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let shirt_now = app.catalog.product(shirt.id).await?;
    println!("   Background reconciliation: small shirt stock now {}\n", shirt_now.variants[0].stock);

    // ========== Scenario 3: check-in twice ==========

    println!("3️⃣  Operator checks Alex in twice");
    let booking_id = receipt.bookings.first().copied().ok_or("no booking committed")?;
    for attempt in 1..=2 {
        match app.check_in.check_in_by_code(&booking_id.to_string()).await? {
            CheckInOutcome::CheckedIn { attendance_count, .. } => {
                println!("   Scan {attempt}: checked in, attendance {attendance_count:?}");
            },
            CheckInOutcome::AlreadyAttended { .. } => println!("   Scan {attempt}: already attended"),
        }
    }
    match app.check_in.lookup("a").await {
        Ok(booking) => println!("   Lookup \"a\": {}", booking.holder_name),
        Err(error) => println!("   Lookup \"a\": {error}"),
    }
    println!();

    // ========== Scenario 4: reconcile attendance ==========

    println!("4️⃣  Sam's counter drifts, operator reconciles");
    storage.set_attendance_count(sam.id, 5).await?;
    let first = app.check_in.reconcile_all().await?;
    let second = app.check_in.reconcile_all().await?;
    println!("   First pass corrected {} of {}", first.corrected.len(), first.examined);
    println!("   Second pass corrected {}\n", second.corrected.len());

    // ========== Scenario 5: payment captured, commit failed ==========

    println!("5️⃣  Storage fails after payment");
    storage.fail_next_booking_writes(1);
    let mut cart = app.event_cart(event.id).await?;
    cart.set_quantity(TicketCategory::Rental, 1);
    match app.checkout.checkout_event(SessionId::new(), Some(&sam), &mut cart).await {
        Ok(receipt) => println!("   Unexpectedly settled: {}", receipt.payment_reference),
        Err(error) => println!("   ✗ {error}"),
    }
    println!();

    // ========== Scenario 6: retail order ==========

    println!("6️⃣  Sam buys chalk for collection");
    let mut retail = app.retail_cart().await?;
    retail.set_item_quantity(StockKey::product(chalk.id), 2);
    println!("   {} = {}", retail.description(), retail.compute_total());
    let buyer = BuyerInfo {
        user_id: sam.id,
        name: sam.display_name.clone(),
        email: "sam@example.com".to_string(),
        shipping_address: None,
    };
    let receipt = app.checkout.checkout_retail(SessionId::new(), Some(&sam), &mut retail, buyer).await?;
    let order_id = receipt.order.ok_or("no order committed")?;
    for next in [OrderStatus::Processing, OrderStatus::Dispatched, OrderStatus::Completed] {
        let order = app.orders.advance_order(order_id, next).await?;
        println!("   Order {} → {}", order.id, order.status);
    }

    app.checkout.shutdown(Duration::from_secs(5)).await?;
    println!("\n✓ Demo complete ({} authorization calls)", gateway.calls());
    Ok(())
}
