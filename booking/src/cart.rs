//! Cart & pricing engine.
//!
//! Carts are transient drafts. Quantities are clamped against the
//! availability the cart was built with, which is advisory: checkout
//! re-validates against live inventory before asking for payment.
//!
//! # Pricing
//!
//! ```text
//! ticket subtotal = Σ qty × category price
//! ticket total    = ticket subtotal × (1 − discount), rounded half-up once
//! extras total    = Σ qty × extra price            (never discounted)
//! total           = ticket total + extras total
//! ```

use crate::error::ValidationError;
use crate::inventory::{EventAvailability, EventSelection, RetailSelection, StockKey};
use crate::membership::MEMBER_DISCOUNT_PERCENT;
use crate::types::{Event, ExtraKey, Money, OrderLineItem, Product, TicketCategory, UserProfile};
use serde::{Deserialize, Serialize};

/// One ticket category line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketLine {
    /// Category
    pub category: TicketCategory,
    /// Slots
    pub quantity: u32,
    /// Price per slot
    pub unit_price: Money,
    /// `quantity × unit_price`, before discount
    pub subtotal: Money,
}

/// One extra line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraLine {
    /// Cart key
    pub key: ExtraKey,
    /// Display name
    pub name: String,
    /// Units
    pub quantity: u32,
    /// Price per unit
    pub unit_price: Money,
    /// `quantity × unit_price`
    pub subtotal: Money,
}

/// Itemised price of an event selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    /// Ticket lines in category order
    pub tickets: Vec<TicketLine>,
    /// Sum of ticket lines before discount
    pub ticket_subtotal: Money,
    /// Discount applied to tickets
    pub discount_percent: u8,
    /// Ticket subtotal after discount
    pub ticket_total: Money,
    /// Extra lines in key order
    pub extras: Vec<ExtraLine>,
    /// Sum of extra lines
    pub extras_total: Money,
    /// Amount to charge
    pub total: Money,
}

impl PriceBreakdown {
    /// Amount taken off the ticket subtotal
    #[must_use]
    pub const fn discount(&self) -> Money {
        self.ticket_subtotal.saturating_sub(self.ticket_total)
    }

    /// Amount charged per booking row
    ///
    /// One row per category present. The discounted ticket total is split so
    /// the rows sum exactly to [`PriceBreakdown::total`]; the extras are
    /// carried by the first row.
    #[must_use]
    pub fn category_totals(&self) -> Vec<(TicketCategory, Money)> {
        let mut allocated = Money::ZERO;
        let last = self.tickets.len().saturating_sub(1);

        self.tickets
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let share = if index == last {
                    self.ticket_total.saturating_sub(allocated)
                } else {
                    line.subtotal.discounted(self.discount_percent)
                };
                allocated = allocated.saturating_add(share);
                let row = if index == 0 { share.saturating_add(self.extras_total) } else { share };
                (line.category, row)
            })
            .collect()
    }
}

/// Price an event selection
///
/// Extras without an offer in `availability` are skipped; validation rejects
/// them before this runs on the checkout path.
#[must_use]
pub fn price_event_selection(
    event: &Event,
    availability: &EventAvailability,
    selection: &EventSelection,
    discount_percent: u8,
) -> PriceBreakdown {
    let tickets: Vec<TicketLine> = selection
        .tickets
        .iter()
        .map(|(&category, &quantity)| {
            let unit_price = event.pool(category).unit_price;
            TicketLine {
                category,
                quantity,
                unit_price,
                subtotal: unit_price.times(quantity),
            }
        })
        .collect();

    let extras: Vec<ExtraLine> = selection
        .extras
        .iter()
        .filter_map(|(key, &quantity)| {
            let offer = availability.offer(key)?;
            Some(ExtraLine {
                key: *key,
                name: offer.name.clone(),
                quantity,
                unit_price: offer.unit_price,
                subtotal: offer.unit_price.times(quantity),
            })
        })
        .collect();

    let ticket_subtotal: Money = tickets.iter().map(|line| line.subtotal).sum();
    let ticket_total = ticket_subtotal.discounted(discount_percent);
    let extras_total: Money = extras.iter().map(|line| line.subtotal).sum();

    PriceBreakdown {
        tickets,
        ticket_subtotal,
        discount_percent,
        ticket_total,
        extras,
        extras_total,
        total: ticket_total.saturating_add(extras_total),
    }
}

/// Human-readable summary handed to the payment collaborator
#[must_use]
pub fn describe_event_selection(event: &Event, breakdown: &PriceBreakdown) -> String {
    let lines: Vec<String> = breakdown
        .tickets
        .iter()
        .map(|line| format!("{} × {}", line.quantity, line.category.label()))
        .chain(breakdown.extras.iter().map(|line| format!("{} × {}", line.quantity, line.name)))
        .collect();
    format!("{}: {}", event.name, lines.join(", "))
}

/// Draft booking for one event
#[derive(Clone, Debug)]
pub struct EventCart {
    event: Event,
    availability: EventAvailability,
    selection: EventSelection,
}

impl EventCart {
    /// Empty cart for `event`
    #[must_use]
    pub fn new(event: Event, availability: EventAvailability) -> Self {
        let selection = EventSelection::new(event.id);
        Self {
            event,
            availability,
            selection,
        }
    }

    /// Event being booked
    #[must_use]
    pub const fn event(&self) -> &Event {
        &self.event
    }

    /// Availability the cart clamps against
    #[must_use]
    pub const fn availability(&self) -> &EventAvailability {
        &self.availability
    }

    /// Set a ticket quantity, clamped to `[0, remaining]`; returns the stored value
    pub fn set_quantity(&mut self, category: TicketCategory, quantity: u32) -> u32 {
        let clamped = quantity.min(self.availability.remaining(category));
        if clamped == 0 {
            self.selection.tickets.remove(&category);
        } else {
            self.selection.tickets.insert(category, clamped);
        }
        clamped
    }

    /// Current ticket quantity
    #[must_use]
    pub fn quantity(&self, category: TicketCategory) -> u32 {
        self.selection.tickets.get(&category).copied().unwrap_or(0)
    }

    /// Set an extra quantity, clamped to `[0, stock]`; returns the stored value
    ///
    /// Other lines drawing on the same stock unit count against it. Keys the
    /// event does not offer always clamp to zero.
    pub fn set_extra_quantity(&mut self, key: ExtraKey, quantity: u32) -> u32 {
        let clamped = quantity.min(self.availability.stock_left(&key, &self.selection.extras));
        if clamped == 0 {
            self.selection.extras.remove(&key);
        } else {
            self.selection.extras.insert(key, clamped);
        }
        clamped
    }

    /// Add one unit of an extra, respecting stock; returns the stored value
    pub fn increment_extra(&mut self, key: ExtraKey) -> u32 {
        let next = self.extra_quantity(&key).saturating_add(1);
        self.set_extra_quantity(key, next)
    }

    /// Current extra quantity
    #[must_use]
    pub fn extra_quantity(&self, key: &ExtraKey) -> u32 {
        self.selection.extras.get(key).copied().unwrap_or(0)
    }

    /// Replace the availability and re-clamp every line
    ///
    /// Returns `true` if any quantity had to be reduced.
    pub fn refresh_availability(&mut self, availability: EventAvailability) -> bool {
        self.availability = availability;
        let before = self.selection.clone();

        for (&category, &quantity) in &before.tickets {
            self.set_quantity(category, quantity);
        }
        for (&key, &quantity) in &before.extras {
            self.set_extra_quantity(key, quantity);
        }

        if self.selection != before {
            tracing::debug!(event_id = %self.event.id, "Cart clamped to fresh availability");
            return true;
        }
        false
    }

    /// Itemised price
    #[must_use]
    pub fn breakdown(&self, membership_active: bool) -> PriceBreakdown {
        let discount = if membership_active { MEMBER_DISCOUNT_PERCENT } else { 0 };
        price_event_selection(&self.event, &self.availability, &self.selection, discount)
    }

    /// Amount to charge
    #[must_use]
    pub fn compute_total(&self, membership_active: bool) -> Money {
        self.breakdown(membership_active).total
    }

    /// Summary for the payment collaborator
    #[must_use]
    pub fn description(&self) -> String {
        describe_event_selection(&self.event, &self.breakdown(false))
    }

    /// Whether at least one ticket is selected
    #[must_use]
    pub fn has_tickets(&self) -> bool {
        !self.selection.tickets.is_empty()
    }

    /// Whether nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selection.is_empty()
    }

    /// The selection handed to checkout
    #[must_use]
    pub fn selection(&self) -> EventSelection {
        self.selection.clone()
    }

    /// Discard every line
    pub fn clear(&mut self) {
        self.selection = EventSelection::new(self.event.id);
    }
}

/// Priced retail selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailQuote {
    /// Lines with captured prices
    pub items: Vec<OrderLineItem>,
    /// Sum of lines
    pub subtotal: Money,
    /// Shipping charged
    pub shipping_fee: Money,
    /// Amount to charge
    pub total: Money,
}

/// Price a retail selection
///
/// Shipping is waived when every line is a pickup-only product. Lines naming
/// unknown products are skipped; validation rejects them on the checkout path.
#[must_use]
pub fn price_retail_selection(selection: &RetailSelection, products: &[Product], shipping_fee: Money) -> RetailQuote {
    let mut pickup_only = true;
    let items: Vec<OrderLineItem> = selection
        .lines
        .iter()
        .filter_map(|(key, &quantity)| {
            let product = products.iter().find(|product| product.id == key.product_id)?;
            let (unit_price, _, name) = product.unit(key.variant_id)?;
            pickup_only &= product.pickup_only;
            Some(OrderLineItem {
                product_id: key.product_id,
                variant_id: key.variant_id,
                name,
                unit_price,
                quantity,
            })
        })
        .collect();

    let subtotal: Money = items.iter().map(OrderLineItem::subtotal).sum();
    let shipping_fee = if items.is_empty() || pickup_only { Money::ZERO } else { shipping_fee };

    RetailQuote {
        items,
        subtotal,
        shipping_fee,
        total: subtotal.saturating_add(shipping_fee),
    }
}

/// Draft retail order
#[derive(Clone, Debug)]
pub struct RetailCart {
    products: Vec<Product>,
    selection: RetailSelection,
    shipping_fee: Money,
}

impl RetailCart {
    /// Empty cart over a catalog snapshot
    #[must_use]
    pub fn new(products: Vec<Product>, shipping_fee: Money) -> Self {
        Self {
            products,
            selection: RetailSelection::default(),
            shipping_fee,
        }
    }

    /// Set a line quantity, clamped to `[0, stock]`; returns the stored value
    pub fn set_item_quantity(&mut self, key: StockKey, quantity: u32) -> u32 {
        let stock = self
            .products
            .iter()
            .find(|product| product.id == key.product_id)
            .and_then(|product| product.unit(key.variant_id))
            .map_or(0, |(_, stock, _)| stock);
        let clamped = quantity.min(stock);
        if clamped == 0 {
            self.selection.lines.remove(&key);
        } else {
            self.selection.lines.insert(key, clamped);
        }
        clamped
    }

    /// Current line quantity
    #[must_use]
    pub fn quantity(&self, key: &StockKey) -> u32 {
        self.selection.lines.get(key).copied().unwrap_or(0)
    }

    /// Replace the catalog snapshot and re-clamp every line
    pub fn refresh_products(&mut self, products: Vec<Product>) {
        self.products = products;
        for (key, quantity) in self.selection.lines.clone() {
            self.set_item_quantity(key, quantity);
        }
    }

    /// Itemised price
    #[must_use]
    pub fn quote(&self) -> RetailQuote {
        price_retail_selection(&self.selection, &self.products, self.shipping_fee)
    }

    /// Lines plus shipping
    #[must_use]
    pub fn compute_total(&self) -> Money {
        self.quote().total
    }

    /// Summary for the payment collaborator
    #[must_use]
    pub fn description(&self) -> String {
        describe_retail_quote(&self.quote())
    }

    /// Whether nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selection.is_empty()
    }

    /// The selection handed to checkout
    #[must_use]
    pub fn selection(&self) -> RetailSelection {
        self.selection.clone()
    }

    /// Discard every line
    pub fn clear(&mut self) {
        self.selection = RetailSelection::default();
    }
}

/// Human-readable summary of a retail quote
#[must_use]
pub fn describe_retail_quote(quote: &RetailQuote) -> String {
    let lines: Vec<String> = quote
        .items
        .iter()
        .map(|item| format!("{} × {}", item.quantity, item.name))
        .collect();
    format!("Shop order: {}", lines.join(", "))
}

/// Gate the checkout button
///
/// The actor must be signed in, hold a waiver for `current_year` (or the
/// administrative exemption) and the total must be non-zero.
///
/// # Errors
///
/// The first unmet condition as a [`ValidationError`].
pub fn checkout_guard(
    actor: Option<&UserProfile>,
    total: Money,
    current_year: i32,
) -> Result<&UserProfile, ValidationError> {
    let actor = actor.ok_or(ValidationError::NotAuthenticated)?;
    if !actor.waiver_valid_for(current_year) {
        return Err(ValidationError::WaiverRequired { year: current_year });
    }
    if total.is_zero() {
        return Err(ValidationError::EmptyCart);
    }
    Ok(actor)
}
