//! Inventory model: finite event capacity and product/variant stock.
//!
//! Pure data and arithmetic. Availability is always derived from the booking
//! rows and product records handed in; nothing here caches or performs I/O.

use crate::types::{Booking, Event, EventId, ExtraKey, Money, Product, ProductId, TicketCategory, VariantId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when a selection no longer fits the inventory
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryError {
    /// More units requested than remain
    #[error("Not enough {item} available: requested {requested}, only {available} left")]
    CapacityExceeded {
        /// What ran out
        item: String,
        /// Units requested
        requested: u32,
        /// Units remaining
        available: u32,
    },

    /// The extra is not offered for this event
    #[error("Extra {0} is not offered for this event")]
    UnknownExtra(ExtraKey),

    /// The product or variant does not exist
    #[error("Product {0} does not exist")]
    UnknownProduct(StockKey),
}

/// A stock-carrying unit: a product, or one variant of it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StockKey {
    /// Product
    pub product_id: ProductId,
    /// Variant, when the product has variants
    pub variant_id: Option<VariantId>,
}

impl StockKey {
    /// Key for a product without variants
    #[must_use]
    pub const fn product(product_id: ProductId) -> Self {
        Self {
            product_id,
            variant_id: None,
        }
    }

    /// Key for one variant of a product
    #[must_use]
    pub const fn variant(product_id: ProductId, variant_id: VariantId) -> Self {
        Self {
            product_id,
            variant_id: Some(variant_id),
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant_id {
            Some(variant_id) => write!(f, "{}:{variant_id}", self.product_id),
            None => write!(f, "{}", self.product_id),
        }
    }
}

impl FromStr for StockKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid stock key: {s}");
        match s.split_once(':') {
            Some((product, variant)) => Ok(Self::variant(
                ProductId::parse(product).ok_or_else(invalid)?,
                VariantId::parse(variant).ok_or_else(invalid)?,
            )),
            None => Ok(Self::product(ProductId::parse(s).ok_or_else(invalid)?)),
        }
    }
}

// Same string form as `ExtraKey`, so retail selections can key JSON maps.
impl Serialize for StockKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StockKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Sum of booked quantities for one event and category
#[must_use]
pub fn booked_quantity(bookings: &[Booking], event_id: EventId, category: TicketCategory) -> u32 {
    bookings
        .iter()
        .filter(|booking| booking.event_id == event_id && booking.category == category)
        .fold(0_u32, |total, booking| total.saturating_add(booking.quantity))
}

/// `capacity − booked`, saturating at zero
#[must_use]
pub fn remaining_capacity(event: &Event, bookings: &[Booking], category: TicketCategory) -> u32 {
    event
        .pool(category)
        .capacity
        .saturating_sub(booked_quantity(bookings, event.id, category))
}

/// Price and stock of one extra key at a point in time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOffer {
    /// Cart key
    pub key: ExtraKey,
    /// Stock unit backing the key
    pub stock_key: StockKey,
    /// Display name, including the variant
    pub name: String,
    /// Variant price when present, else the product's
    pub unit_price: Money,
    /// Variant stock when present, else the product's
    pub stock: u32,
}

/// Snapshot of what can still be sold for one event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAvailability {
    /// Event the snapshot describes
    pub event_id: EventId,
    remaining: BTreeMap<TicketCategory, u32>,
    offers: BTreeMap<ExtraKey, ExtraOffer>,
}

impl EventAvailability {
    /// Derive availability from the event, its bookings and the catalog
    ///
    /// Extras whose product is missing or not flagged as extra-eligible are
    /// left out. Products with variants yield one offer per variant.
    #[must_use]
    pub fn compute(event: &Event, bookings: &[Booking], products: &[Product]) -> Self {
        let remaining = TicketCategory::ALL
            .into_iter()
            .map(|category| (category, remaining_capacity(event, bookings, category)))
            .collect();

        let mut offers = BTreeMap::new();
        for extra in &event.extras {
            let Some(product) = products.iter().find(|product| product.id == extra.product_id) else {
                continue;
            };
            if !product.extra_eligible {
                continue;
            }

            if product.has_variants() {
                for variant in &product.variants {
                    let key = ExtraKey::variant(extra.id, variant.id);
                    offers.insert(
                        key,
                        ExtraOffer {
                            key,
                            stock_key: StockKey::variant(product.id, variant.id),
                            name: format!("{} ({})", product.name, variant.name),
                            unit_price: variant.price,
                            stock: variant.stock,
                        },
                    );
                }
            } else {
                let key = ExtraKey::plain(extra.id);
                offers.insert(
                    key,
                    ExtraOffer {
                        key,
                        stock_key: StockKey::product(product.id),
                        name: product.name.clone(),
                        unit_price: product.price,
                        stock: product.stock,
                    },
                );
            }
        }

        Self {
            event_id: event.id,
            remaining,
            offers,
        }
    }

    /// Slots left in `category`
    #[must_use]
    pub fn remaining(&self, category: TicketCategory) -> u32 {
        self.remaining.get(&category).copied().unwrap_or(0)
    }

    /// Offer for `key`, if the extra is sold with this event
    #[must_use]
    pub fn offer(&self, key: &ExtraKey) -> Option<&ExtraOffer> {
        self.offers.get(key)
    }

    /// Stock for `key`; zero when not offered
    #[must_use]
    pub fn stock(&self, key: &ExtraKey) -> u32 {
        self.offer(key).map_or(0, |offer| offer.stock)
    }

    /// Stock left for `key` after the other lines of `extras` drawing on the same unit
    #[must_use]
    pub fn stock_left(&self, key: &ExtraKey, extras: &BTreeMap<ExtraKey, u32>) -> u32 {
        let Some(offer) = self.offer(key) else {
            return 0;
        };
        let taken = extras
            .iter()
            .filter(|(other, _)| *other != key)
            .filter(|(other, _)| self.offer(other).is_some_and(|shared| shared.stock_key == offer.stock_key))
            .fold(0_u32, |taken, (_, &quantity)| taken.saturating_add(quantity));
        offer.stock.saturating_sub(taken)
    }

    /// Every offer, ordered by key
    pub fn offers(&self) -> impl Iterator<Item = &ExtraOffer> {
        self.offers.values()
    }
}

/// Ticket and extra quantities chosen for one event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSelection {
    /// Event being booked
    pub event_id: EventId,
    /// Quantity per category; zero entries are omitted
    pub tickets: BTreeMap<TicketCategory, u32>,
    /// Quantity per extra key; zero entries are omitted
    pub extras: BTreeMap<ExtraKey, u32>,
}

impl EventSelection {
    /// Empty selection for `event_id`
    #[must_use]
    pub const fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            tickets: BTreeMap::new(),
            extras: BTreeMap::new(),
        }
    }

    /// Set a ticket quantity without clamping
    #[must_use]
    pub fn with_tickets(mut self, category: TicketCategory, quantity: u32) -> Self {
        if quantity == 0 {
            self.tickets.remove(&category);
        } else {
            self.tickets.insert(category, quantity);
        }
        self
    }

    /// Set an extra quantity without clamping
    #[must_use]
    pub fn with_extra(mut self, key: ExtraKey, quantity: u32) -> Self {
        if quantity == 0 {
            self.extras.remove(&key);
        } else {
            self.extras.insert(key, quantity);
        }
        self
    }

    /// Total slots across categories
    #[must_use]
    pub fn ticket_count(&self) -> u32 {
        self.tickets.values().fold(0_u32, |total, n| total.saturating_add(*n))
    }

    /// Whether nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.extras.is_empty()
    }
}

/// Quantities chosen from the retail catalog
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailSelection {
    /// Quantity per stock unit; zero entries are omitted
    pub lines: BTreeMap<StockKey, u32>,
}

impl RetailSelection {
    /// Set a line quantity without clamping
    #[must_use]
    pub fn with_line(mut self, key: StockKey, quantity: u32) -> Self {
        if quantity == 0 {
            self.lines.remove(&key);
        } else {
            self.lines.insert(key, quantity);
        }
        self
    }

    /// Whether nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Authoritative check of an event selection against fresh availability
///
/// Rejects rather than truncating.
///
/// # Errors
///
/// [`InventoryError::CapacityExceeded`] for the first category or stock unit
/// that no longer fits, [`InventoryError::UnknownExtra`] for an extra not
/// offered. Extras drawing on the same stock unit are checked together.
pub fn validate_event_selection(
    selection: &EventSelection,
    availability: &EventAvailability,
) -> Result<(), InventoryError> {
    for (&category, &requested) in &selection.tickets {
        let available = availability.remaining(category);
        if requested > available {
            return Err(InventoryError::CapacityExceeded {
                item: format!("{} tickets", category.label()),
                requested,
                available,
            });
        }
    }

    let mut per_unit: BTreeMap<StockKey, (u32, &ExtraOffer)> = BTreeMap::new();
    for (key, &requested) in &selection.extras {
        let offer = availability
            .offer(key)
            .ok_or(InventoryError::UnknownExtra(*key))?;
        let (total, _) = per_unit.entry(offer.stock_key).or_insert((0, offer));
        *total = total.saturating_add(requested);
    }

    for (requested, offer) in per_unit.into_values() {
        if requested > offer.stock {
            return Err(InventoryError::CapacityExceeded {
                item: offer.name.clone(),
                requested,
                available: offer.stock,
            });
        }
    }

    Ok(())
}

/// Authoritative check of a retail selection against fresh product records
///
/// # Errors
///
/// [`InventoryError::UnknownProduct`] when a line names a missing product or
/// variant, [`InventoryError::CapacityExceeded`] when stock is short.
pub fn validate_retail_selection(selection: &RetailSelection, products: &[Product]) -> Result<(), InventoryError> {
    for (key, &requested) in &selection.lines {
        let (_, stock, name) = products
            .iter()
            .find(|product| product.id == key.product_id)
            .and_then(|product| product.unit(key.variant_id))
            .ok_or(InventoryError::UnknownProduct(*key))?;
        if requested > stock {
            return Err(InventoryError::CapacityExceeded {
                item: name,
                requested,
                available: stock,
            });
        }
    }

    Ok(())
}
