//! Check-in engine.
//!
//! Bookings move `Booked → Attended` once. The owner's attendance counter is
//! never incremented; after every change to a booking it is recomputed from
//! the set of attended bookings and overwritten, so repeated or racing
//! check-ins cannot double count and earlier drift heals itself.
//!
//! Recomputes for one user run one at a time, so a slow write can never
//! land after a newer count.

use crate::storage::{StorageError, VenueStorage};
use crate::types::{Booking, BookingId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Result of a check-in that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckInOutcome {
    /// The booking moved to attended
    CheckedIn {
        /// Booking after the transition
        booking: Booking,
        /// Owner's recomputed counter; `None` if it could not be written
        attendance_count: Option<u32>,
    },

    /// The booking was already attended; nothing changed
    AlreadyAttended {
        /// Booking as stored
        booking: Booking,
    },
}

impl CheckInOutcome {
    /// Booking the outcome refers to
    #[must_use]
    pub const fn booking(&self) -> &Booking {
        match self {
            Self::CheckedIn { booking, .. } | Self::AlreadyAttended { booking } => booking,
        }
    }

    /// Whether this was a repeat check-in
    #[must_use]
    pub const fn is_already_attended(&self) -> bool {
        matches!(self, Self::AlreadyAttended { .. })
    }
}

/// Check-in errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckInError {
    /// Nothing matched
    #[error("No booking matches {0:?}")]
    NotFound(String),

    /// A name search matched more than one booking
    #[error("{} bookings match {query:?}; choose one", .matches.len())]
    Ambiguous {
        /// Search text
        query: String,
        /// Every match, for the operator to pick from
        matches: Vec<Booking>,
    },

    /// Storage collaborator failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a bulk counter reconciliation did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendanceReconciliation {
    /// Users examined
    pub examined: usize,
    /// Users whose cached counter was overwritten
    pub corrected: Vec<UserId>,
}

/// What an administrative attendance override did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceOverride {
    /// Whether this call flipped the flag; false if it already held the value
    pub changed: bool,
    /// Owner's recomputed counter; `None` if it could not be written
    pub attendance_count: Option<u32>,
}

/// Operator-facing check-in operations
#[derive(Clone)]
pub struct CheckInEngine {
    storage: Arc<dyn VenueStorage>,
    refresh_locks: Arc<Mutex<HashMap<UserId, Arc<Mutex<()>>>>>,
}

impl CheckInEngine {
    /// Create a check-in engine
    #[must_use]
    pub fn new(storage: Arc<dyn VenueStorage>) -> Self {
        Self {
            storage,
            refresh_locks: Arc::default(),
        }
    }

    /// Mark `booking_id` attended and recompute the owner's counter
    ///
    /// A repeat check-in, including one that lost a race with another
    /// operator, is reported as [`CheckInOutcome::AlreadyAttended`].
    ///
    /// # Errors
    ///
    /// [`CheckInError::NotFound`] if no booking with that id belongs to `user_id`.
    #[tracing::instrument(skip(self))]
    pub async fn check_in(&self, booking_id: BookingId, user_id: UserId) -> Result<CheckInOutcome, CheckInError> {
        let booking = self.load(booking_id).await?;
        if booking.user_id != user_id {
            return Err(CheckInError::NotFound(booking_id.to_string()));
        }

        if booking.attended || !self.storage.compare_and_set_attended(booking_id, false, true).await? {
            metrics::counter!("check_in.already_attended").increment(1);
            tracing::info!(booking_id = %booking_id, user_id = %user_id, "Booking already attended");
            let booking = self.load(booking_id).await?;
            return Ok(CheckInOutcome::AlreadyAttended { booking });
        }

        let attendance_count = self.refresh_counter(user_id).await;
        metrics::counter!("check_in.completed").increment(1);
        tracing::info!(booking_id = %booking_id, user_id = %user_id, attendance_count = ?attendance_count, "Checked in");

        Ok(CheckInOutcome::CheckedIn {
            booking: Booking {
                attended: true,
                ..booking
            },
            attendance_count,
        })
    }

    /// Find exactly one booking by id or holder name
    ///
    /// A string that parses as a booking id and names an existing booking
    /// wins outright. Otherwise the query is matched case-insensitively as a
    /// substring of holder names.
    ///
    /// # Errors
    ///
    /// [`CheckInError::NotFound`] or [`CheckInError::Ambiguous`].
    pub async fn lookup(&self, query: &str) -> Result<Booking, CheckInError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CheckInError::NotFound(String::new()));
        }

        if let Some(booking_id) = BookingId::parse(query) {
            match self.storage.load_booking(booking_id).await {
                Ok(booking) => return Ok(booking),
                Err(error) if error.is_not_found() => {},
                Err(error) => return Err(error.into()),
            }
        }

        let needle = query.to_lowercase();
        let matches: Vec<Booking> = self
            .storage
            .list_bookings()
            .await?
            .into_iter()
            .filter(|booking| booking.holder_name.to_lowercase().contains(&needle))
            .collect();

        match <[Booking; 1]>::try_from(matches) {
            Ok([booking]) => Ok(booking),
            Err(matches) if matches.is_empty() => Err(CheckInError::NotFound(query.to_string())),
            Err(matches) => Err(CheckInError::Ambiguous {
                query: query.to_string(),
                matches,
            }),
        }
    }

    /// Resolve a scanned or typed code and check its booking in
    ///
    /// # Errors
    ///
    /// As [`CheckInEngine::lookup`] and [`CheckInEngine::check_in`].
    #[tracing::instrument(skip(self))]
    pub async fn check_in_by_code(&self, code: &str) -> Result<CheckInOutcome, CheckInError> {
        let booking = self.lookup(code).await?;
        self.check_in(booking.id, booking.user_id).await
    }

    /// Force `attended` to a value; an administrative edit, not a check-in
    ///
    /// The owner's counter is recomputed either way.
    ///
    /// # Errors
    ///
    /// [`CheckInError::NotFound`] if the booking does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn override_attendance(
        &self,
        booking_id: BookingId,
        attended: bool,
    ) -> Result<AttendanceOverride, CheckInError> {
        let booking = self.load(booking_id).await?;
        let changed = self
            .storage
            .compare_and_set_attended(booking_id, !attended, attended)
            .await?;
        if changed {
            tracing::info!(booking_id = %booking_id, attended, "Attendance overridden");
        } else {
            tracing::info!(booking_id = %booking_id, attended, "Attendance already at requested value");
        }

        Ok(AttendanceOverride {
            changed,
            attendance_count: self.refresh_counter(booking.user_id).await,
        })
    }

    /// Delete a booking and recompute its owner's counter
    ///
    /// # Errors
    ///
    /// [`CheckInError::NotFound`] if the booking does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn delete_booking(&self, booking_id: BookingId) -> Result<Booking, CheckInError> {
        let booking = self.storage.delete_booking(booking_id).await.map_err(|error| {
            if error.is_not_found() {
                CheckInError::NotFound(booking_id.to_string())
            } else {
                error.into()
            }
        })?;
        tracing::info!(booking_id = %booking_id, user_id = %booking.user_id, "Booking deleted");
        self.refresh_counter(booking.user_id).await;
        Ok(booking)
    }

    /// Recompute every user's counter, writing only those that disagree
    ///
    /// Running this twice with no check-in in between writes nothing the
    /// second time.
    ///
    /// # Errors
    ///
    /// [`CheckInError::Storage`] if listing or a write fails.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_all(&self) -> Result<AttendanceReconciliation, CheckInError> {
        let mut attended: HashMap<UserId, u32> = HashMap::new();
        for booking in self.storage.list_bookings().await? {
            if booking.attended {
                *attended.entry(booking.user_id).or_default() += 1;
            }
        }

        let mut summary = AttendanceReconciliation::default();
        for user in self.storage.list_users().await? {
            summary.examined += 1;
            let actual = attended.get(&user.id).copied().unwrap_or(0);
            if user.attendance_count != actual {
                self.storage.set_attendance_count(user.id, actual).await?;
                tracing::info!(user_id = %user.id, cached = user.attendance_count, actual, "Attendance counter corrected");
                summary.corrected.push(user.id);
            }
        }

        tracing::info!(examined = summary.examined, corrected = summary.corrected.len(), "Attendance reconciled");
        Ok(summary)
    }

    async fn load(&self, booking_id: BookingId) -> Result<Booking, CheckInError> {
        self.storage.load_booking(booking_id).await.map_err(|error| {
            if error.is_not_found() {
                CheckInError::NotFound(booking_id.to_string())
            } else {
                error.into()
            }
        })
    }

    /// Recompute and write one user's counter, serialized per user
    async fn refresh_counter(&self, user_id: UserId) -> Option<u32> {
        let lock = Arc::clone(self.refresh_locks.lock().await.entry(user_id).or_default());
        let count = {
            let _serial = lock.lock().await;
            self.recompute_counter(user_id).await
        };

        drop(lock);
        let mut locks = self.refresh_locks.lock().await;
        if locks.get(&user_id).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(&user_id);
        }
        count
    }

    /// Count attended bookings across all events and overwrite the counter
    async fn recompute_counter(&self, user_id: UserId) -> Option<u32> {
        let count = match self.storage.list_user_bookings(user_id).await {
            Ok(bookings) => bookings.iter().filter(|booking| booking.attended).count(),
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "Could not read bookings to recompute attendance");
                return None;
            },
        };
        let count = u32::try_from(count).unwrap_or(u32::MAX);

        match self.storage.set_attendance_count(user_id, count).await {
            Ok(()) => Some(count),
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "Could not write attendance counter");
                None
            },
        }
    }
}
