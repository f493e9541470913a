//! Checkout reconciliation saga.
//!
//! One attempt per checkout, driven through:
//!
//! ```text
//! Idle ──validated──► AwaitingAuthorization ──authorized──► Committing ──► Settled
//!  │                        │                                   │
//!  └──rejected──► Failed ◄──┘ declined / cancelled / timed out  └──write failed──► PaidButUncommitted
//! ```
//!
//! A cancel while idle ends the attempt at once. A cancel while awaiting
//! authorization is recorded and settled by the gateway's answer: a failure
//! confirms it, an authorization refuses it and the attempt commits.
//!
//! Finished attempts are kept for inspection up to a retention limit, oldest
//! evicted first.
//!
//! 1. Re-validate the selection against live inventory (never the cache)
//! 2. Request payment authorization for the re-computed total
//! 3. Commit one booking per ticket category, or one retail order
//! 4. Report the outcome; the caller clears the cart
//! 5. In the background, decrement stock per unit sold and refresh the catalog
//!
//! Operator bookings skip step 2 and record a synthetic payment reference.
//! Every collaborator call runs under its own deadline.

use crate::cart::{describe_event_selection, describe_retail_quote, price_event_selection, price_retail_selection};
use crate::catalog::CatalogCache;
use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, ValidationError};
use crate::inventory::{
    validate_event_selection, validate_retail_selection, EventAvailability, EventSelection, RetailSelection,
};
use crate::membership::MembershipBenefits;
use crate::payment_gateway::{PaymentAuthorization, PaymentGateway, PaymentGatewayError};
use crate::reconciliation::{reconcile, ReconciliationReport, StockDecrement};
use crate::storage::{StorageError, VenueStorage};
use crate::types::{
    AttemptId, Booking, BookingId, BuyerInfo, EventId, ExtraKey, Money, Order, OrderId, OrderLineItem, OrderStatus,
    PaymentReference, SessionId, TicketCategory, UserProfile,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use venue_core::{async_effect, effect::Effect, environment::Clock, reducer::Reducer, smallvec, SmallVec};
use venue_runtime::retry::RetryPolicy;

// ============================================================================
// Requests and plans
// ============================================================================

/// What an attempt is trying to buy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutRequest {
    /// Customer event booking, paid through the gateway
    EventBooking {
        /// Tickets and extras
        selection: EventSelection,
    },

    /// Operator booking on behalf of the actor; no payment is taken
    OperatorBooking {
        /// Tickets and extras
        selection: EventSelection,
    },

    /// Retail order, paid through the gateway
    RetailOrder {
        /// Lines
        selection: RetailSelection,
        /// Who the order is for
        buyer: BuyerInfo,
    },
}

impl CheckoutRequest {
    /// Whether payment authorization is skipped
    #[must_use]
    pub const fn skips_payment(&self) -> bool {
        matches!(self, Self::OperatorBooking { .. })
    }
}

/// One booking row to write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedBooking {
    /// Id assigned ahead of the write
    pub id: BookingId,
    /// Category
    pub category: TicketCategory,
    /// Slots
    pub quantity: u32,
    /// Extras attributed to this row
    pub extras: BTreeMap<ExtraKey, u32>,
    /// Amount charged for this row
    pub total: Money,
}

/// Rows the commit step will write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitPlan {
    /// One row per ticket category; extras ride on the first
    Bookings {
        /// Event booked
        event_id: EventId,
        /// Rows in category order
        rows: Vec<PlannedBooking>,
    },

    /// A single retail order
    Order {
        /// Id assigned ahead of the write
        order_id: OrderId,
        /// Lines with captured prices
        items: Vec<OrderLineItem>,
        /// Shipping charged
        shipping_fee: Money,
    },
}

/// Result of re-validating a request against live inventory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedCheckout {
    /// Amount to charge
    pub total: Money,
    /// Summary shown to the payer
    pub description: String,
    /// Rows to write
    pub plan: CommitPlan,
    /// Stock to decrement once committed
    pub decrements: Vec<StockDecrement>,
}

// ============================================================================
// State
// ============================================================================

/// Failure reason recorded on a cancelled attempt
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Phase of a checkout attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutPhase {
    /// Re-validating; nothing requested yet
    Idle,
    /// Waiting on the payment collaborator
    AwaitingAuthorization,
    /// Writing rows
    Committing,
    /// Rows written and reported
    Settled,
    /// Ended before any money moved
    Failed {
        /// Why
        reason: String,
    },
    /// Money moved, rows did not get written
    PaidButUncommitted {
        /// Reference to reconcile by hand
        payment_reference: PaymentReference,
        /// Why the write failed
        reason: String,
    },
}

impl CheckoutPhase {
    /// Whether the attempt has an outcome
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Settled | Self::Failed { .. } | Self::PaidButUncommitted { .. }
        )
    }
}

/// One checkout attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutAttempt {
    /// Attempt identifier
    pub id: AttemptId,
    /// Session that started it
    pub session_id: SessionId,
    /// Who the rows are for
    pub actor: UserProfile,
    /// What is being bought
    pub request: CheckoutRequest,
    /// Current phase
    pub phase: CheckoutPhase,
    /// Validated plan, once re-validation passes
    pub validated: Option<ValidatedCheckout>,
    /// Set once payment is authorized (or synthesised)
    pub payment_reference: Option<PaymentReference>,
    /// The actor asked to abandon the attempt
    pub cancelled: bool,
    /// Booking rows written
    pub committed_bookings: Vec<BookingId>,
    /// Retail order written
    pub committed_order: Option<OrderId>,
    /// Background reconciliation outcome
    pub reconciliation: Option<ReconciliationReport>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
}

impl CheckoutAttempt {
    /// Validated total, if known
    #[must_use]
    pub fn total(&self) -> Option<Money> {
        self.validated.as_ref().map(|validated| validated.total)
    }
}

/// Finished attempts kept when no retention is configured
pub const DEFAULT_RETAINED_ATTEMPTS: usize = 1024;

/// State of every checkout attempt hosted by one store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutState {
    attempts: HashMap<AttemptId, CheckoutAttempt>,
    active_sessions: HashMap<SessionId, AttemptId>,
    /// Terminal attempts, oldest first
    finished: VecDeque<AttemptId>,
    retention: usize,
}

impl Default for CheckoutState {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_ATTEMPTS)
    }
}

impl CheckoutState {
    /// Creates an empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty state keeping at most `retention` finished attempts
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            attempts: HashMap::new(),
            active_sessions: HashMap::new(),
            finished: VecDeque::new(),
            retention,
        }
    }

    /// Attempts held, finished or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Whether no attempt is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Look up an attempt
    #[must_use]
    pub fn attempt(&self, attempt_id: &AttemptId) -> Option<&CheckoutAttempt> {
        self.attempts.get(attempt_id)
    }

    /// The non-terminal attempt holding `session_id`, if any
    #[must_use]
    pub fn active_attempt(&self, session_id: &SessionId) -> Option<AttemptId> {
        self.active_sessions.get(session_id).copied()
    }

    /// Attempts without an outcome yet
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.attempts
            .values()
            .filter(|attempt| !attempt.phase.is_terminal())
            .count()
    }

    fn release_session(&mut self, attempt_id: AttemptId) {
        self.active_sessions.retain(|_, held_by| *held_by != attempt_id);
    }

    /// Release the session and queue the attempt for eviction
    fn finish(&mut self, attempt_id: AttemptId) {
        self.release_session(attempt_id);
        self.finished.push_back(attempt_id);
        while self.finished.len() > self.retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.attempts.remove(&evicted);
                tracing::debug!(attempt_id = %evicted, "Evicted finished checkout attempt");
            }
        }
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the checkout saga
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckoutAction {
    // Commands
    /// Begin a checkout
    StartCheckout {
        /// Attempt ID, chosen by the caller
        attempt_id: AttemptId,
        /// Session of the actor
        session_id: SessionId,
        /// Who the rows are for
        actor: UserProfile,
        /// What is being bought
        request: CheckoutRequest,
    },

    /// Abandon an attempt before authorization completes
    CancelCheckout {
        /// Attempt ID
        attempt_id: AttemptId,
    },

    // Events
    /// Live inventory accepted the request
    CheckoutValidated {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Plan and price
        validated: ValidatedCheckout,
    },

    /// Rejected before any money moved
    CheckoutRejected {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Why
        error: CheckoutError,
    },

    /// Payment collaborator authorized the total
    PaymentAuthorized {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Authorization
        authorization: PaymentAuthorization,
    },

    /// Payment declined, cancelled, unavailable or timed out
    AuthorizationFailed {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Gateway error
        error: PaymentGatewayError,
    },

    /// Every row was written
    CheckoutCommitted {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Reference recorded on the rows
        payment_reference: PaymentReference,
        /// Amount charged
        total: Money,
        /// Booking rows written
        bookings: Vec<BookingId>,
        /// Order written
        order: Option<OrderId>,
    },

    /// A write failed after payment was authorized
    CommitFailed {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Reference of the captured payment
        payment_reference: PaymentReference,
        /// Why the write failed
        reason: String,
        /// Rows written before the failure
        committed: Vec<BookingId>,
    },

    /// Cancellation confirmed; nothing was charged
    CheckoutCancelled {
        /// Attempt ID
        attempt_id: AttemptId,
    },

    /// Cancellation refused; payment was authorized, the attempt finished or is unknown
    CancelRefused {
        /// Attempt ID
        attempt_id: AttemptId,
        /// Why
        reason: String,
    },

    /// Background stock decrement and cache refresh finished
    ReconciliationFinished {
        /// Attempt ID
        attempt_id: AttemptId,
        /// What happened
        report: ReconciliationReport,
    },
}

impl CheckoutAction {
    /// Attempt the action refers to
    #[must_use]
    pub const fn attempt_id(&self) -> AttemptId {
        match self {
            Self::StartCheckout { attempt_id, .. }
            | Self::CancelCheckout { attempt_id }
            | Self::CheckoutValidated { attempt_id, .. }
            | Self::CheckoutRejected { attempt_id, .. }
            | Self::PaymentAuthorized { attempt_id, .. }
            | Self::AuthorizationFailed { attempt_id, .. }
            | Self::CheckoutCommitted { attempt_id, .. }
            | Self::CommitFailed { attempt_id, .. }
            | Self::CheckoutCancelled { attempt_id }
            | Self::CancelRefused { attempt_id, .. }
            | Self::ReconciliationFinished { attempt_id, .. } => *attempt_id,
        }
    }

    /// Whether this action is the outcome a checkout caller waits for
    #[must_use]
    pub fn is_outcome_for(&self, attempt_id: AttemptId) -> bool {
        self.attempt_id() == attempt_id
            && matches!(
                self,
                Self::CheckoutRejected { .. }
                    | Self::AuthorizationFailed { .. }
                    | Self::CheckoutCommitted { .. }
                    | Self::CommitFailed { .. }
                    | Self::CheckoutCancelled { .. }
            )
    }

    /// Whether this action answers a cancellation
    #[must_use]
    pub fn is_cancel_answer_for(&self, attempt_id: AttemptId) -> bool {
        self.attempt_id() == attempt_id
            && matches!(self, Self::CheckoutCancelled { .. } | Self::CancelRefused { .. })
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Deadlines for each collaborator call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckoutTimeouts {
    /// Inventory re-validation
    pub validation: Duration,
    /// Payment authorization
    pub authorization: Duration,
    /// Durable writes, across all rows
    pub commit: Duration,
}

impl CheckoutTimeouts {
    /// Deadlines from configuration
    #[must_use]
    pub const fn from_config(config: &CheckoutConfig) -> Self {
        Self {
            validation: config.validation_timeout(),
            authorization: config.authorization_timeout(),
            commit: config.commit_timeout(),
        }
    }

    /// Longest a caller can wait for an outcome
    #[must_use]
    pub fn total(&self) -> Duration {
        self.validation + self.authorization + self.commit
    }
}

/// Environment dependencies for the checkout saga
#[derive(Clone)]
pub struct CheckoutEnvironment {
    /// Durable storage
    pub storage: Arc<dyn VenueStorage>,
    /// Payment collaborator
    pub gateway: Arc<dyn PaymentGateway>,
    /// Cache refreshed after commits
    pub catalog: Arc<CatalogCache>,
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Collaborator deadlines
    pub timeouts: CheckoutTimeouts,
    /// Backoff for stock decrements
    pub reconcile_policy: RetryPolicy,
    /// Retail shipping fee
    pub shipping_fee: Money,
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the checkout saga
#[derive(Clone, Debug, Default)]
pub struct CheckoutReducer;

impl CheckoutReducer {
    /// Creates a new `CheckoutReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate_effect(
        attempt_id: AttemptId,
        actor: UserProfile,
        request: CheckoutRequest,
        env: &CheckoutEnvironment,
    ) -> Effect<CheckoutAction> {
        let storage = Arc::clone(&env.storage);
        let deadline = env.timeouts.validation;
        let shipping_fee = env.shipping_fee;

        async_effect! {
            let outcome = tokio::time::timeout(
                deadline,
                validate_request(storage.as_ref(), &actor, &request, shipping_fee),
            )
            .await
            .unwrap_or_else(|_| Err(CheckoutError::Unavailable("inventory check timed out".to_string())));

            Some(match outcome {
                Ok(validated) => CheckoutAction::CheckoutValidated { attempt_id, validated },
                Err(error) => CheckoutAction::CheckoutRejected { attempt_id, error },
            })
        }
    }

    fn authorize_effect(attempt_id: AttemptId, total: Money, description: String, env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
        let gateway = Arc::clone(&env.gateway);
        let deadline = env.timeouts.authorization;

        async_effect! {
            let result = tokio::time::timeout(deadline, gateway.authorize(total, description))
                .await
                .unwrap_or(Err(PaymentGatewayError::Timeout));

            Some(match result {
                Ok(authorization) => CheckoutAction::PaymentAuthorized { attempt_id, authorization },
                Err(error) => CheckoutAction::AuthorizationFailed { attempt_id, error },
            })
        }
    }

    fn commit_effect(attempt: &CheckoutAttempt, reference: PaymentReference, env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
        let Some(validated) = attempt.validated.as_ref() else {
            tracing::error!(attempt_id = %attempt.id, "Commit requested without a validated plan");
            return Effect::None;
        };

        let storage = Arc::clone(&env.storage);
        let commit_timeout = env.timeouts.commit;
        let attempt_id = attempt.id;
        let total = validated.total;
        let now = env.clock.now();

        match validated.plan.clone() {
            CommitPlan::Bookings { event_id, rows } => {
                let bookings: Vec<Booking> = rows
                    .into_iter()
                    .map(|row| Booking {
                        id: row.id,
                        user_id: attempt.actor.id,
                        holder_name: attempt.actor.display_name.clone(),
                        event_id,
                        category: row.category,
                        quantity: row.quantity,
                        extras: row.extras,
                        total: row.total,
                        payment_reference: reference.clone(),
                        attended: false,
                        created_at: now,
                    })
                    .collect();

                async_effect! {
                    let deadline = tokio::time::Instant::now() + commit_timeout;
                    let mut committed = Vec::with_capacity(bookings.len());
                    for booking in bookings {
                        let booking_id = booking.id;
                        let failure = match tokio::time::timeout_at(deadline, storage.create_booking(booking)).await {
                            Ok(Ok(())) => {
                                committed.push(booking_id);
                                continue;
                            },
                            Ok(Err(error)) => error.to_string(),
                            Err(_) => "durable write timed out".to_string(),
                        };
                        return Some(CheckoutAction::CommitFailed {
                            attempt_id,
                            payment_reference: reference,
                            reason: failure,
                            committed,
                        });
                    }
                    Some(CheckoutAction::CheckoutCommitted {
                        attempt_id,
                        payment_reference: reference,
                        total,
                        bookings: committed,
                        order: None,
                    })
                }
            },
            CommitPlan::Order {
                order_id,
                items,
                shipping_fee,
            } => {
                let CheckoutRequest::RetailOrder { buyer, .. } = &attempt.request else {
                    tracing::error!(attempt_id = %attempt.id, "Order plan on a non-retail request");
                    return Effect::None;
                };
                let order = Order {
                    id: order_id,
                    buyer: buyer.clone(),
                    items,
                    shipping_fee,
                    total,
                    status: OrderStatus::Pending,
                    payment_reference: reference.clone(),
                    created_at: now,
                };

                async_effect! {
                    let failure = match tokio::time::timeout(commit_timeout, storage.create_order(order)).await {
                        Ok(Ok(())) => {
                            return Some(CheckoutAction::CheckoutCommitted {
                                attempt_id,
                                payment_reference: reference,
                                total,
                                bookings: Vec::new(),
                                order: Some(order_id),
                            });
                        },
                        Ok(Err(error)) => error.to_string(),
                        Err(_) => "durable write timed out".to_string(),
                    };
                    Some(CheckoutAction::CommitFailed {
                        attempt_id,
                        payment_reference: reference,
                        reason: failure,
                        committed: Vec::new(),
                    })
                }
            },
        }
    }

    fn reconcile_effect(attempt_id: AttemptId, decrements: Vec<StockDecrement>, env: &CheckoutEnvironment) -> Effect<CheckoutAction> {
        let storage = Arc::clone(&env.storage);
        let catalog = Arc::clone(&env.catalog);
        let policy = env.reconcile_policy.clone();

        async_effect! {
            let report = reconcile(storage.as_ref(), catalog.as_ref(), &policy, &decrements).await;
            if !report.is_clean() {
                tracing::warn!(
                    attempt_id = %attempt_id,
                    failures = report.failures.len(),
                    catalog_refreshed = report.catalog_refreshed,
                    "Reconciliation finished with failures"
                );
            }
            Some(CheckoutAction::ReconciliationFinished { attempt_id, report })
        }
    }

    fn fail(state: &mut CheckoutState, attempt_id: AttemptId, reason: String) {
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.phase = CheckoutPhase::Failed { reason };
        }
        state.finish(attempt_id);
        metrics::counter!("checkout.failed").increment(1);
    }

    /// End a cancelled attempt; nothing was charged
    fn confirm_cancel(state: &mut CheckoutState, attempt_id: AttemptId) -> Effect<CheckoutAction> {
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.phase = CheckoutPhase::Failed {
                reason: CANCELLED_BY_USER.to_string(),
            };
        }
        state.finish(attempt_id);
        metrics::counter!("checkout.cancelled").increment(1);
        async_effect! {
            Some(CheckoutAction::CheckoutCancelled { attempt_id })
        }
    }
}

impl Reducer for CheckoutReducer {
    type State = CheckoutState;
    type Action = CheckoutAction;
    type Environment = CheckoutEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per saga step
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Step 1: Start and re-validate ==========
            CheckoutAction::StartCheckout {
                attempt_id,
                session_id,
                actor,
                request,
            } => {
                if state.attempts.contains_key(&attempt_id) || state.active_sessions.contains_key(&session_id) {
                    tracing::info!(attempt_id = %attempt_id, session_id = %session_id, "Checkout already in progress");
                    return smallvec![async_effect! {
                        Some(CheckoutAction::CheckoutRejected { attempt_id, error: CheckoutError::InProgress })
                    }];
                }

                tracing::info!(attempt_id = %attempt_id, user_id = %actor.id, "Checkout started");
                state.active_sessions.insert(session_id, attempt_id);
                state.attempts.insert(
                    attempt_id,
                    CheckoutAttempt {
                        id: attempt_id,
                        session_id,
                        actor: actor.clone(),
                        request: request.clone(),
                        phase: CheckoutPhase::Idle,
                        validated: None,
                        payment_reference: None,
                        cancelled: false,
                        committed_bookings: Vec::new(),
                        committed_order: None,
                        reconciliation: None,
                        started_at: env.clock.now(),
                    },
                );

                smallvec![Self::validate_effect(attempt_id, actor, request, env)]
            },

            CheckoutAction::CheckoutRejected { attempt_id, error } => {
                // An in-progress rejection never created an attempt of its own.
                if error == CheckoutError::InProgress {
                    return SmallVec::new();
                }
                let Some(attempt) = state.attempts.get(&attempt_id) else {
                    return SmallVec::new();
                };
                if attempt.phase != CheckoutPhase::Idle {
                    return SmallVec::new();
                }

                tracing::info!(attempt_id = %attempt_id, error = %error, "Checkout rejected before payment");
                Self::fail(state, attempt_id, error.to_string());
                SmallVec::new()
            },

            // ========== Step 2: Request authorization ==========
            CheckoutAction::CheckoutValidated { attempt_id, validated } => {
                let Some(attempt) = state.attempts.get_mut(&attempt_id) else {
                    return SmallVec::new();
                };
                if attempt.phase != CheckoutPhase::Idle {
                    // Cancelled while validating; nothing was requested.
                    return SmallVec::new();
                }

                let total = validated.total;
                let description = validated.description.clone();
                attempt.validated = Some(validated);

                if attempt.request.skips_payment() {
                    let reference = PaymentReference::operator(attempt_id);
                    tracing::info!(attempt_id = %attempt_id, payment_reference = %reference, "Operator booking, payment skipped");
                    attempt.payment_reference = Some(reference.clone());
                    attempt.phase = CheckoutPhase::Committing;
                    return smallvec![Self::commit_effect(attempt, reference, env)];
                }

                tracing::info!(attempt_id = %attempt_id, total = %total, "Requesting payment authorization");
                attempt.phase = CheckoutPhase::AwaitingAuthorization;
                smallvec![Self::authorize_effect(attempt_id, total, description, env)]
            },

            // ========== Step 3: Commit ==========
            CheckoutAction::PaymentAuthorized {
                attempt_id,
                authorization,
            } => {
                let Some(attempt) = state.attempts.get_mut(&attempt_id) else {
                    tracing::error!(
                        attempt_id = %attempt_id,
                        payment_reference = %authorization.reference,
                        "Authorization for unknown attempt"
                    );
                    return SmallVec::new();
                };

                if attempt.phase != CheckoutPhase::AwaitingAuthorization {
                    tracing::warn!(
                        attempt_id = %attempt_id,
                        payment_reference = %authorization.reference,
                        "Duplicate authorization ignored"
                    );
                    return SmallVec::new();
                }

                tracing::info!(attempt_id = %attempt_id, payment_reference = %authorization.reference, "Payment authorized");
                attempt.payment_reference = Some(authorization.reference.clone());
                attempt.phase = CheckoutPhase::Committing;
                let commit = Self::commit_effect(attempt, authorization.reference.clone(), env);

                if !attempt.cancelled {
                    return smallvec![commit];
                }

                // Money has moved; the booking is owed even though the actor asked to leave.
                metrics::counter!("checkout.late_authorization").increment(1);
                tracing::warn!(
                    attempt_id = %attempt_id,
                    payment_reference = %authorization.reference,
                    "Authorization arrived after cancel request, committing anyway"
                );
                smallvec![
                    commit,
                    async_effect! {
                        Some(CheckoutAction::CancelRefused {
                            attempt_id,
                            reason: "payment already authorized".to_string(),
                        })
                    },
                ]
            },

            CheckoutAction::AuthorizationFailed { attempt_id, error } => {
                let Some(attempt) = state.attempts.get(&attempt_id) else {
                    return SmallVec::new();
                };
                if attempt.phase != CheckoutPhase::AwaitingAuthorization {
                    return SmallVec::new();
                }

                if attempt.cancelled {
                    tracing::info!(attempt_id = %attempt_id, error = %error, "Cancellation confirmed, payment not authorized");
                    return smallvec![Self::confirm_cancel(state, attempt_id)];
                }

                tracing::info!(attempt_id = %attempt_id, error = %error, "Payment not authorized");
                Self::fail(state, attempt_id, error.to_string());
                SmallVec::new()
            },

            // ========== Step 4: Report ==========
            CheckoutAction::CheckoutCommitted {
                attempt_id,
                bookings,
                order,
                ..
            } => {
                let Some(attempt) = state.attempts.get_mut(&attempt_id) else {
                    return SmallVec::new();
                };
                if attempt.phase != CheckoutPhase::Committing {
                    return SmallVec::new();
                }

                attempt.phase = CheckoutPhase::Settled;
                attempt.committed_bookings = bookings;
                attempt.committed_order = order;
                let decrements = attempt
                    .validated
                    .as_ref()
                    .map(|validated| validated.decrements.clone())
                    .unwrap_or_default();
                tracing::info!(
                    attempt_id = %attempt_id,
                    payment_reference = ?attempt.payment_reference.as_ref().map(PaymentReference::as_str),
                    rows = attempt.committed_bookings.len() + usize::from(attempt.committed_order.is_some()),
                    "Checkout settled"
                );
                state.finish(attempt_id);
                metrics::counter!("checkout.settled").increment(1);

                // ========== Step 5: Background reconciliation ==========
                smallvec![Self::reconcile_effect(attempt_id, decrements, env)]
            },

            CheckoutAction::CommitFailed {
                attempt_id,
                payment_reference,
                reason,
                committed,
            } => {
                let Some(attempt) = state.attempts.get_mut(&attempt_id) else {
                    return SmallVec::new();
                };
                if attempt.phase != CheckoutPhase::Committing {
                    return SmallVec::new();
                }

                tracing::error!(
                    attempt_id = %attempt_id,
                    payment_reference = %payment_reference,
                    user_id = %attempt.actor.id,
                    committed = committed.len(),
                    reason = %reason,
                    "Payment captured but commit failed; manual reconciliation required"
                );
                attempt.committed_bookings = committed;
                attempt.phase = CheckoutPhase::PaidButUncommitted {
                    payment_reference,
                    reason,
                };
                state.finish(attempt_id);
                metrics::counter!("checkout.paid_but_uncommitted").increment(1);
                SmallVec::new()
            },

            // ========== Cancellation ==========
            CheckoutAction::CancelCheckout { attempt_id } => {
                let reason = match state.attempts.get_mut(&attempt_id) {
                    None => "unknown checkout attempt".to_string(),
                    Some(attempt) => match attempt.phase {
                        CheckoutPhase::Idle => {
                            attempt.cancelled = true;
                            tracing::info!(attempt_id = %attempt_id, "Checkout cancelled by actor");
                            return smallvec![Self::confirm_cancel(state, attempt_id)];
                        },
                        CheckoutPhase::AwaitingAuthorization if attempt.cancelled => {
                            // Already waiting on the gateway; its answer settles both requests.
                            return SmallVec::new();
                        },
                        CheckoutPhase::AwaitingAuthorization => {
                            attempt.cancelled = true;
                            tracing::info!(
                                attempt_id = %attempt_id,
                                "Cancel requested while authorizing, waiting for the gateway"
                            );
                            return SmallVec::new();
                        },
                        CheckoutPhase::Committing | CheckoutPhase::Settled => "payment already authorized".to_string(),
                        CheckoutPhase::Failed { .. } | CheckoutPhase::PaidButUncommitted { .. } => {
                            "checkout already finished".to_string()
                        },
                    },
                };

                tracing::info!(attempt_id = %attempt_id, reason = %reason, "Cancellation refused");
                smallvec![async_effect! {
                    Some(CheckoutAction::CancelRefused { attempt_id, reason })
                }]
            },

            CheckoutAction::ReconciliationFinished { attempt_id, report } => {
                if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
                    attempt.reconciliation = Some(report);
                }
                SmallVec::new()
            },

            // Notifications only
            CheckoutAction::CheckoutCancelled { .. } | CheckoutAction::CancelRefused { .. } => SmallVec::new(),
        }
    }
}

// ============================================================================
// Re-validation
// ============================================================================

fn storage_unavailable(error: &StorageError) -> CheckoutError {
    CheckoutError::Unavailable(error.to_string())
}

/// Re-fetch inventory, validate, price and plan a request
async fn validate_request(
    storage: &dyn VenueStorage,
    actor: &UserProfile,
    request: &CheckoutRequest,
    shipping_fee: Money,
) -> Result<ValidatedCheckout, CheckoutError> {
    match request {
        CheckoutRequest::EventBooking { selection } | CheckoutRequest::OperatorBooking { selection } => {
            validate_event_request(storage, actor, selection).await
        },
        CheckoutRequest::RetailOrder { selection, .. } => validate_retail_request(storage, selection, shipping_fee).await,
    }
}

async fn validate_event_request(
    storage: &dyn VenueStorage,
    actor: &UserProfile,
    selection: &EventSelection,
) -> Result<ValidatedCheckout, CheckoutError> {
    if selection.tickets.is_empty() {
        return Err(ValidationError::NoTickets.into());
    }

    let event = storage.load_event(selection.event_id).await.map_err(|error| {
        if error.is_not_found() {
            ValidationError::UnknownEvent(selection.event_id).into()
        } else {
            storage_unavailable(&error)
        }
    })?;
    let bookings = storage
        .list_event_bookings(event.id)
        .await
        .map_err(|error| storage_unavailable(&error))?;
    let products = storage.list_products().await.map_err(|error| storage_unavailable(&error))?;

    let availability = EventAvailability::compute(&event, &bookings, &products);
    validate_event_selection(selection, &availability)?;

    let discount = MembershipBenefits::for_profile(actor).discount_percent();
    let breakdown = price_event_selection(&event, &availability, selection, discount);

    let rows = breakdown
        .category_totals()
        .into_iter()
        .enumerate()
        .map(|(index, (category, total))| PlannedBooking {
            id: BookingId::new(),
            category,
            quantity: selection.tickets.get(&category).copied().unwrap_or(0),
            extras: if index == 0 { selection.extras.clone() } else { BTreeMap::new() },
            total,
        })
        .collect();

    let decrements = selection
        .extras
        .iter()
        .filter_map(|(key, &quantity)| {
            availability.offer(key).map(|offer| StockDecrement {
                key: offer.stock_key,
                quantity,
            })
        })
        .collect();

    Ok(ValidatedCheckout {
        total: breakdown.total,
        description: describe_event_selection(&event, &breakdown),
        plan: CommitPlan::Bookings {
            event_id: event.id,
            rows,
        },
        decrements,
    })
}

async fn validate_retail_request(
    storage: &dyn VenueStorage,
    selection: &RetailSelection,
    shipping_fee: Money,
) -> Result<ValidatedCheckout, CheckoutError> {
    if selection.is_empty() {
        return Err(ValidationError::EmptyCart.into());
    }

    let products = storage.list_products().await.map_err(|error| storage_unavailable(&error))?;
    validate_retail_selection(selection, &products)?;

    let quote = price_retail_selection(selection, &products, shipping_fee);
    let decrements = selection
        .lines
        .iter()
        .map(|(&key, &quantity)| StockDecrement { key, quantity })
        .collect();

    Ok(ValidatedCheckout {
        total: quote.total,
        description: describe_retail_quote(&quote),
        plan: CommitPlan::Order {
            order_id: OrderId::new(),
            items: quote.items,
            shipping_fee: quote.shipping_fee,
        },
        decrements,
    })
}
