//! Domain types for the venue booking subsystem.
//!
//! Value objects (identifiers, money, extra keys) and the records the storage
//! collaborator persists: events, bookings, products, retail orders and user
//! profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parse the hyphenated or simple textual form
            #[must_use]
            pub fn parse(text: &str) -> Option<Self> {
                Uuid::parse_str(text.trim()).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a scheduled event
    EventId
);
uuid_id!(
    /// Unique identifier for a booking row
    BookingId
);
uuid_id!(
    /// Unique identifier for a user profile
    UserId
);
uuid_id!(
    /// Unique identifier for a retail product
    ProductId
);
uuid_id!(
    /// Unique identifier for a product variant
    VariantId
);
uuid_id!(
    /// Unique identifier for an extra offered alongside an event
    ExtraId
);
uuid_id!(
    /// Unique identifier for a retail order
    OrderId
);
uuid_id!(
    /// Unique identifier for one checkout attempt
    AttemptId
);
uuid_id!(
    /// Unique identifier for an actor's session
    SessionId
);

/// Correlation reference returned by the payment collaborator
///
/// Opaque to this crate; it is recorded on every row a payment pays for so a
/// human can reconcile money against records.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentReference(String);

impl PaymentReference {
    const OPERATOR_PREFIX: &'static str = "operator-";

    /// Wrap a reference issued by the payment collaborator
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Synthetic reference recorded for operator bookings that skip payment
    #[must_use]
    pub fn operator(attempt_id: AttemptId) -> Self {
        Self(format!("{}{}", Self::OPERATOR_PREFIX, attempt_id.as_uuid().simple()))
    }

    /// Whether this reference was synthesised for an operator booking
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(Self::OPERATOR_PREFIX)
    }

    /// The raw reference string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money Value Object (pence-based to avoid floating point errors)
// ============================================================================

/// An amount of money in pence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero pence
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from pence
    #[must_use]
    pub const fn from_pence(pence: u64) -> Self {
        Self(pence)
    }

    /// Creates a `Money` value from whole pounds, saturating on overflow
    #[must_use]
    pub const fn from_pounds(pounds: u64) -> Self {
        Self(pounds.saturating_mul(100))
    }

    /// Returns the amount in pence
    #[must_use]
    pub const fn pence(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Adds two amounts, saturating at `u64::MAX` pence
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtracts, returning `None` if the result would be negative
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts, clamping at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiplies by a quantity, saturating on overflow
    #[must_use]
    pub const fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(quantity as u64))
    }

    /// Removes `percent`% and rounds half-up to the nearest penny
    ///
    /// `Money::from_pence(4999).discounted(10)` is 4499 (4499.1 rounds down),
    /// `Money::from_pence(5).discounted(10)` is 5 (4.5 rounds up).
    #[must_use]
    pub fn discounted(self, percent: u8) -> Self {
        let keep = u128::from(100_u8.saturating_sub(percent.min(100)));
        let scaled = u128::from(self.0) * keep;
        let rounded = (scaled + 50) / 100;
        Self(u64::try_from(rounded).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "£{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

// ============================================================================
// Events, extras and capacity pools
// ============================================================================

/// One of the two independent capacity pools of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TicketCategory {
    /// Bring-your-own-kit entry
    WalkOn,
    /// Entry including rental kit
    Rental,
}

impl TicketCategory {
    /// Every category, in the order extras are attached to them
    pub const ALL: [Self; 2] = [Self::WalkOn, Self::Rental];

    /// Human-readable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::WalkOn => "Walk-on",
            Self::Rental => "Rental",
        }
    }
}

impl fmt::Display for TicketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WalkOn => "walkOn",
            Self::Rental => "rental",
        })
    }
}

/// Capacity and unit price of one ticket category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPool {
    /// Total slots in the pool
    pub capacity: u32,
    /// Price per slot
    pub unit_price: Money,
}

impl CapacityPool {
    /// Creates a pool
    #[must_use]
    pub const fn new(capacity: u32, unit_price: Money) -> Self {
        Self { capacity, unit_price }
    }
}

/// An optional add-on offered with an event, backed by a retail product
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    /// Extra identifier
    pub id: ExtraId,
    /// Product supplying price, stock and variants
    pub product_id: ProductId,
}

/// Key of an extra line in a cart or booking
///
/// Renders as `extraId` or `extraId:variantId`; each variant tracks its own
/// stock and price, so it needs its own key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtraKey {
    /// The extra
    pub extra_id: ExtraId,
    /// Variant of the extra's product, when it has variants
    pub variant_id: Option<VariantId>,
}

impl ExtraKey {
    /// Key for an extra whose product has no variants
    #[must_use]
    pub const fn plain(extra_id: ExtraId) -> Self {
        Self {
            extra_id,
            variant_id: None,
        }
    }

    /// Key for one variant of an extra
    #[must_use]
    pub const fn variant(extra_id: ExtraId, variant_id: VariantId) -> Self {
        Self {
            extra_id,
            variant_id: Some(variant_id),
        }
    }
}

impl fmt::Display for ExtraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant_id {
            Some(variant_id) => write!(f, "{}:{variant_id}", self.extra_id),
            None => write!(f, "{}", self.extra_id),
        }
    }
}

/// Error parsing an [`ExtraKey`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid extra key: {0}")]
pub struct ParseExtraKeyError(String);

impl FromStr for ExtraKey {
    type Err = ParseExtraKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseExtraKeyError(s.to_string());
        match s.split_once(':') {
            Some((extra, variant)) => Ok(Self::variant(
                ExtraId::parse(extra).ok_or_else(invalid)?,
                VariantId::parse(variant).ok_or_else(invalid)?,
            )),
            None => Ok(Self::plain(ExtraId::parse(s).ok_or_else(invalid)?)),
        }
    }
}

// Serialized as the string form so it can key JSON maps.
impl Serialize for ExtraKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExtraKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A scheduled event with two capacity pools and optional extras
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Display name
    pub name: String,
    /// When the event takes place
    pub scheduled_at: DateTime<Utc>,
    /// Walk-on pool
    pub walk_on: CapacityPool,
    /// Rental pool
    pub rental: CapacityPool,
    /// Extras on offer, in display order
    pub extras: Vec<Extra>,
}

impl Event {
    /// Creates an event with no extras
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        walk_on: CapacityPool,
        rental: CapacityPool,
    ) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            scheduled_at,
            walk_on,
            rental,
            extras: Vec::new(),
        }
    }

    /// Offer `product_id` as an extra, returning the new extra's id
    pub fn add_extra(&mut self, product_id: ProductId) -> ExtraId {
        let id = ExtraId::new();
        self.extras.push(Extra { id, product_id });
        id
    }

    /// The pool backing `category`
    #[must_use]
    pub const fn pool(&self, category: TicketCategory) -> &CapacityPool {
        match category {
            TicketCategory::WalkOn => &self.walk_on,
            TicketCategory::Rental => &self.rental,
        }
    }

    /// Look up an extra by id
    #[must_use]
    pub fn extra(&self, extra_id: ExtraId) -> Option<&Extra> {
        self.extras.iter().find(|extra| extra.id == extra_id)
    }
}

// ============================================================================
// Bookings
// ============================================================================

/// A durable booking row for one ticket category of one event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier
    pub id: BookingId,
    /// Owning user
    pub user_id: UserId,
    /// Name shown to operators and matched by free-text lookup
    pub holder_name: String,
    /// Event booked
    pub event_id: EventId,
    /// Ticket category
    pub category: TicketCategory,
    /// Number of slots
    pub quantity: u32,
    /// Extras attributed to this row
    pub extras: BTreeMap<ExtraKey, u32>,
    /// Amount charged for this row
    pub total: Money,
    /// Payment this row was paid by
    pub payment_reference: PaymentReference,
    /// Set once at check-in
    pub attended: bool,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Retail catalog
// ============================================================================

/// A variant of a product, with its own price and stock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Variant identifier
    pub id: VariantId,
    /// Display name (e.g. a size)
    pub name: String,
    /// Price, superseding the product's
    pub price: Money,
    /// Stock, superseding the product's
    pub stock: u32,
}

impl Variant {
    /// Creates a variant
    #[must_use]
    pub fn new(name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: VariantId::new(),
            name: name.into(),
            price,
            stock,
        }
    }
}

/// A retail product
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier
    pub id: ProductId,
    /// Display name
    pub name: String,
    /// Price when the product has no variants
    pub price: Money,
    /// Stock when the product has no variants
    pub stock: u32,
    /// Collected in person, never shipped
    pub pickup_only: bool,
    /// May be offered as an event extra
    pub extra_eligible: bool,
    /// Variants; when non-empty they supersede `price` and `stock`
    pub variants: Vec<Variant>,
}

impl Product {
    /// Creates a shippable product with no variants
    #[must_use]
    pub fn new(name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: ProductId::new(),
            name: name.into(),
            price,
            stock,
            pickup_only: false,
            extra_eligible: false,
            variants: Vec::new(),
        }
    }

    /// Mark as collect-in-person
    #[must_use]
    pub const fn pickup_only(mut self) -> Self {
        self.pickup_only = true;
        self
    }

    /// Allow the product to be offered as an event extra
    #[must_use]
    pub const fn extra_eligible(mut self) -> Self {
        self.extra_eligible = true;
        self
    }

    /// Add a variant
    #[must_use]
    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    /// Whether price and stock live on variants
    #[must_use]
    pub fn has_variants(&self) -> bool {
        !self.variants.is_empty()
    }

    /// Look up a variant
    #[must_use]
    pub fn variant(&self, variant_id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.id == variant_id)
    }

    /// Price, stock and display name of the sellable unit
    ///
    /// `None` if the product has variants but none was named, or the named
    /// variant does not exist.
    #[must_use]
    pub fn unit(&self, variant_id: Option<VariantId>) -> Option<(Money, u32, String)> {
        match (variant_id, self.has_variants()) {
            (None, false) => Some((self.price, self.stock, self.name.clone())),
            (Some(variant_id), true) => self
                .variant(variant_id)
                .map(|variant| (variant.price, variant.stock, format!("{} ({})", self.name, variant.name))),
            _ => None,
        }
    }
}

// ============================================================================
// Retail orders
// ============================================================================

/// Fulfillment status of a retail order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    /// Committed, not yet picked
    Pending,
    /// Being picked and packed
    Processing,
    /// Handed to the carrier
    Dispatched,
    /// Delivered or collected
    Completed,
    /// Cancelled by an operator
    Cancelled,
}

impl OrderStatus {
    /// Whether no further transition is allowed
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Forward transitions plus cancellation from any non-terminal status
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Dispatched)
                | (Self::Dispatched, Self::Completed)
                | (Self::Pending | Self::Processing | Self::Dispatched, Self::Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Who a retail order is for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerInfo {
    /// Purchasing user
    pub user_id: UserId,
    /// Name on the order
    pub name: String,
    /// Contact email
    pub email: String,
    /// Delivery address; `None` for collection
    pub shipping_address: Option<String>,
}

/// An order line with the price captured at checkout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    /// Product bought
    pub product_id: ProductId,
    /// Variant bought, if any
    pub variant_id: Option<VariantId>,
    /// Name at time of purchase
    pub name: String,
    /// Price at time of purchase
    pub unit_price: Money,
    /// Units bought
    pub quantity: u32,
}

impl OrderLineItem {
    /// `unit_price × quantity`
    #[must_use]
    pub const fn subtotal(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// A durable retail order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Buyer
    pub buyer: BuyerInfo,
    /// Lines with captured prices
    pub items: Vec<OrderLineItem>,
    /// Shipping charged
    pub shipping_fee: Money,
    /// Amount charged
    pub total: Money,
    /// Fulfillment status
    pub status: OrderStatus,
    /// Payment this order was paid by
    pub payment_reference: PaymentReference,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Users and membership
// ============================================================================

/// Membership status of a user
///
/// A pending application is tracked by [`UserProfile::membership_applied`],
/// not by a status of its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipStatus {
    /// Not a member
    #[default]
    None,
    /// Approved member
    Active,
    /// Lapsed by an operator
    Expired,
}

/// A user/member profile
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User identifier
    pub id: UserId,
    /// Name copied onto bookings
    pub display_name: String,
    /// Cached count of attended bookings; recomputed, never incremented
    pub attendance_count: u32,
    /// Membership status
    pub membership_status: MembershipStatus,
    /// Membership application awaiting an operator decision
    pub membership_applied: bool,
    /// Reference code assigned on approval
    pub membership_code: Option<String>,
    /// Store credit balance
    pub credits: Money,
    /// Calendar year of the signed liability waiver
    pub waiver_year: Option<i32>,
    /// Administrative exemption from the waiver requirement
    pub waiver_exempt: bool,
}

impl UserProfile {
    /// Creates a profile with no attendance, membership or waiver
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            display_name: display_name.into(),
            attendance_count: 0,
            membership_status: MembershipStatus::None,
            membership_applied: false,
            membership_code: None,
            credits: Money::ZERO,
            waiver_year: None,
            waiver_exempt: false,
        }
    }

    /// Record a waiver signed for `year`
    #[must_use]
    pub const fn with_waiver(mut self, year: i32) -> Self {
        self.waiver_year = Some(year);
        self
    }

    /// Grant the administrative waiver exemption
    #[must_use]
    pub const fn waiver_exempt(mut self) -> Self {
        self.waiver_exempt = true;
        self
    }

    /// Mark as an active member
    #[must_use]
    pub const fn active_member(mut self) -> Self {
        self.membership_status = MembershipStatus::Active;
        self
    }

    /// Whether the waiver covers `year`
    #[must_use]
    pub fn waiver_valid_for(&self, year: i32) -> bool {
        self.waiver_exempt || self.waiver_year == Some(year)
    }
}
