//! Application coordinator - wires collaborators, stores and services.

use super::services::{CheckoutService, CheckoutStore, OrderService};
use crate::aggregates::{CheckoutEnvironment, CheckoutReducer, CheckoutState, CheckoutTimeouts};
use crate::cart::{EventCart, RetailCart};
use crate::catalog::CatalogCache;
use crate::check_in::CheckInEngine;
use crate::config::Config;
use crate::inventory::EventAvailability;
use crate::membership::MembershipService;
use crate::payment_gateway::PaymentGateway;
use crate::scanner::{CodeDecoder, DecoderStrategy, FrameSource, ScanSession};
use crate::storage::{StorageError, VenueStorage};
use crate::types::EventId;
use std::sync::Arc;
use venue_core::environment::Clock;
use venue_runtime::Store;

/// Venue booking application
///
/// Holds every service over a shared storage collaborator. Cloning the
/// services is cheap; they share the same checkout store.
pub struct VenueApp {
    /// Storage collaborator
    pub storage: Arc<dyn VenueStorage>,
    /// Read-through catalog of events and products
    pub catalog: Arc<CatalogCache>,
    /// Checkout entry points
    pub checkout: CheckoutService,
    /// Retail order fulfillment
    pub orders: OrderService,
    /// Operator check-in
    pub check_in: CheckInEngine,
    /// Membership workflow
    pub membership: MembershipService,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl VenueApp {
    /// Wire the application
    #[must_use]
    pub fn new(
        config: Config,
        storage: Arc<dyn VenueStorage>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        tracing::info!("Initializing venue booking application...");

        let catalog = Arc::new(CatalogCache::new(Arc::clone(&storage), Arc::clone(&clock)));
        let timeouts = CheckoutTimeouts::from_config(&config.checkout);

        let checkout_env = CheckoutEnvironment {
            storage: Arc::clone(&storage),
            gateway,
            catalog: Arc::clone(&catalog),
            clock: Arc::clone(&clock),
            timeouts,
            reconcile_policy: config.reconciliation.retry_policy(),
            shipping_fee: config.retail.shipping_fee(),
        };
        let store: Arc<CheckoutStore> = Arc::new(Store::new(
            CheckoutState::with_retention(config.checkout.retained_attempts),
            CheckoutReducer::new(),
            checkout_env,
        ));
        tracing::info!(
            validation_timeout = ?timeouts.validation,
            authorization_timeout = ?timeouts.authorization,
            commit_timeout = ?timeouts.commit,
            retained_attempts = config.checkout.retained_attempts,
            "✓ Checkout store initialized"
        );

        Self {
            checkout: CheckoutService::new(store, Arc::clone(&clock), timeouts.total()),
            orders: OrderService::new(Arc::clone(&storage)),
            check_in: CheckInEngine::new(Arc::clone(&storage)),
            membership: MembershipService::new(Arc::clone(&storage)),
            catalog,
            storage,
            clock,
            config,
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Clock in use
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Availability of one event: cached catalog, live bookings
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the event or its bookings cannot be read.
    pub async fn availability(&self, event_id: EventId) -> Result<EventAvailability, StorageError> {
        let event = self.catalog.event(event_id).await?;
        let bookings = self.storage.list_event_bookings(event_id).await?;
        let products = self.catalog.products().await?;
        Ok(EventAvailability::compute(&event, &bookings, &products))
    }

    /// Start an empty cart for an event
    ///
    /// Availability bounds are advisory; checkout re-validates.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the event cannot be read.
    pub async fn event_cart(&self, event_id: EventId) -> Result<EventCart, StorageError> {
        let event = self.catalog.event(event_id).await?;
        let availability = self.availability(event_id).await?;
        Ok(EventCart::new(event, availability))
    }

    /// Re-clamp a cart against current availability
    ///
    /// Returns whether any quantity was reduced.
    ///
    /// # Errors
    ///
    /// [`StorageError`] if availability cannot be read.
    pub async fn refresh_event_cart(&self, cart: &mut EventCart) -> Result<bool, StorageError> {
        let availability = self.availability(cart.event().id).await?;
        Ok(cart.refresh_availability(availability))
    }

    /// Start an empty retail cart
    ///
    /// # Errors
    ///
    /// [`StorageError`] if the product catalog cannot be read.
    pub async fn retail_cart(&self) -> Result<RetailCart, StorageError> {
        Ok(RetailCart::new(self.catalog.products().await?, self.config.retail.shipping_fee()))
    }

    /// Open a scan session at the configured frame interval
    ///
    /// `native` is preferred when the platform provides it.
    pub fn start_scan(&self, source: Box<dyn FrameSource>, native: Option<Arc<dyn CodeDecoder>>) -> ScanSession {
        ScanSession::start(source, DecoderStrategy::select(native), self.config.scanner.frame_interval())
    }
}
