//! Membership eligibility workflow.
//!
//! [`MembershipBenefits::evaluate`] is the single place where discount and
//! eligibility are derived from a profile; pricing and the application
//! workflow both read it instead of re-checking flags.
//!
//! ```text
//! none ──apply──► applied ──approve──► active ──expire──► expired
//!                    │
//!                    └──reject──► none (may re-apply)
//! ```

use crate::storage::{StorageError, VenueStorage};
use crate::types::{MembershipStatus, UserId, UserProfile};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Discount applied to ticket subtotals for active members
pub const MEMBER_DISCOUNT_PERCENT: u8 = 10;

/// Attended bookings required before a user may apply
pub const ELIGIBILITY_THRESHOLD: u32 = 3;

const CODE_PREFIX: &str = "VM-";
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 6;
const CODE_ATTEMPTS: usize = 16;

/// What a profile is entitled to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MembershipBenefits {
    /// Ticket subtotals are discounted
    pub discount_active: bool,
    /// The user may submit an application
    pub eligible_to_apply: bool,
}

impl MembershipBenefits {
    /// Derive benefits from membership status, application flag and attendance
    #[must_use]
    pub const fn evaluate(status: MembershipStatus, applied: bool, attendance_count: u32) -> Self {
        Self {
            discount_active: matches!(status, MembershipStatus::Active),
            eligible_to_apply: attendance_count >= ELIGIBILITY_THRESHOLD
                && matches!(status, MembershipStatus::None)
                && !applied,
        }
    }

    /// Benefits of `profile`
    #[must_use]
    pub const fn for_profile(profile: &UserProfile) -> Self {
        Self::evaluate(
            profile.membership_status,
            profile.membership_applied,
            profile.attendance_count,
        )
    }

    /// Discount percentage to apply to ticket subtotals
    #[must_use]
    pub const fn discount_percent(&self) -> u8 {
        if self.discount_active { MEMBER_DISCOUNT_PERCENT } else { 0 }
    }
}

/// Errors from the membership workflow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// Eligibility predicate not met
    #[error("Not eligible to apply: {attendance_count} of {threshold} sessions attended, status {status:?}")]
    NotEligible {
        /// Attended sessions
        attendance_count: u32,
        /// Sessions required
        threshold: u32,
        /// Current status
        status: MembershipStatus,
    },

    /// No application awaiting a decision
    #[error("User {0} has no pending membership application")]
    NoPendingApplication(UserId),

    /// Only active memberships can expire
    #[error("User {0} does not hold an active membership")]
    NotActive(UserId),

    /// Could not allocate an unused reference code
    #[error("Could not allocate a unique membership code")]
    CodeExhausted,

    /// Storage collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Operator and member operations on membership
#[derive(Clone)]
pub struct MembershipService {
    storage: Arc<dyn VenueStorage>,
}

impl MembershipService {
    /// Create a membership service
    #[must_use]
    pub fn new(storage: Arc<dyn VenueStorage>) -> Self {
        Self { storage }
    }

    /// Submit an application; status is unchanged until an operator decides
    ///
    /// # Errors
    ///
    /// [`MembershipError::NotEligible`] if the eligibility predicate fails.
    #[tracing::instrument(skip(self))]
    pub async fn apply(&self, user_id: UserId) -> Result<UserProfile, MembershipError> {
        let mut user = self.storage.load_user(user_id).await?;

        if !MembershipBenefits::for_profile(&user).eligible_to_apply {
            return Err(MembershipError::NotEligible {
                attendance_count: user.attendance_count,
                threshold: ELIGIBILITY_THRESHOLD,
                status: user.membership_status,
            });
        }

        user.membership_applied = true;
        self.storage.save_user(user.clone()).await?;
        tracing::info!(user_id = %user_id, "Membership application submitted");
        Ok(user)
    }

    /// Approve a pending application and assign a unique reference code
    ///
    /// # Errors
    ///
    /// [`MembershipError::NoPendingApplication`] if there is nothing to approve.
    #[tracing::instrument(skip(self))]
    pub async fn approve(&self, user_id: UserId) -> Result<UserProfile, MembershipError> {
        let mut user = self.pending(user_id).await?;

        let taken: HashSet<String> = self
            .storage
            .list_users()
            .await?
            .into_iter()
            .filter_map(|profile| profile.membership_code)
            .collect();
        let code = allocate_code(&taken).ok_or(MembershipError::CodeExhausted)?;

        user.membership_status = MembershipStatus::Active;
        user.membership_code = Some(code.clone());
        self.storage.save_user(user.clone()).await?;
        tracing::info!(user_id = %user_id, membership_code = %code, "Membership approved");
        Ok(user)
    }

    /// Reject a pending application; the user may re-apply once eligible
    ///
    /// # Errors
    ///
    /// [`MembershipError::NoPendingApplication`] if there is nothing to reject.
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, user_id: UserId) -> Result<UserProfile, MembershipError> {
        let mut user = self.pending(user_id).await?;

        user.membership_applied = false;
        self.storage.save_user(user.clone()).await?;
        tracing::info!(user_id = %user_id, "Membership application rejected");
        Ok(user)
    }

    /// Administratively lapse an active membership
    ///
    /// # Errors
    ///
    /// [`MembershipError::NotActive`] unless the membership is active.
    #[tracing::instrument(skip(self))]
    pub async fn expire(&self, user_id: UserId) -> Result<UserProfile, MembershipError> {
        let mut user = self.storage.load_user(user_id).await?;
        if user.membership_status != MembershipStatus::Active {
            return Err(MembershipError::NotActive(user_id));
        }

        user.membership_status = MembershipStatus::Expired;
        self.storage.save_user(user.clone()).await?;
        tracing::info!(user_id = %user_id, "Membership expired");
        Ok(user)
    }

    /// Applications awaiting an operator decision
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn pending_applications(&self) -> Result<Vec<UserProfile>, MembershipError> {
        Ok(self
            .storage
            .list_users()
            .await?
            .into_iter()
            .filter(is_pending)
            .collect())
    }

    async fn pending(&self, user_id: UserId) -> Result<UserProfile, MembershipError> {
        let user = self.storage.load_user(user_id).await?;
        if is_pending(&user) {
            Ok(user)
        } else {
            Err(MembershipError::NoPendingApplication(user_id))
        }
    }
}

fn is_pending(user: &UserProfile) -> bool {
    user.membership_applied && user.membership_status == MembershipStatus::None
}

fn allocate_code(taken: &HashSet<String>) -> Option<String> {
    let mut rng = rand::thread_rng();
    (0..CODE_ATTEMPTS)
        .map(|_| {
            let suffix: String = (0..CODE_LENGTH)
                .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
                .collect();
            format!("{CODE_PREFIX}{suffix}")
        })
        .find(|code| !taken.contains(code))
}
