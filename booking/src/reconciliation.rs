//! Post-commit reconciliation.
//!
//! After a checkout settles, one stock unit is decremented per unit of every
//! extra or retail line sold, then the catalog cache is refreshed. Each
//! decrement is retried with backoff; whatever still fails is logged and
//! counted. Nothing here can change the outcome the actor was already given.

use crate::catalog::CatalogCache;
use crate::inventory::StockKey;
use crate::storage::VenueStorage;
use serde::{Deserialize, Serialize};
use venue_runtime::retry::{retry_with_backoff, RetryPolicy};

/// Units of one stock key sold by a commit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockDecrement {
    /// Stock unit
    pub key: StockKey,
    /// Units sold
    pub quantity: u32,
}

/// A decrement that could not be applied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockFailure {
    /// Stock unit
    pub key: StockKey,
    /// Last error after retries
    pub error: String,
}

/// What background reconciliation managed to do
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Units decremented
    pub decremented: u32,
    /// Units that could not be decremented
    pub failures: Vec<StockFailure>,
    /// Whether the catalog cache was reloaded
    pub catalog_refreshed: bool,
}

impl ReconciliationReport {
    /// Whether every step succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.catalog_refreshed
    }
}

/// Decrement stock per unit sold and refresh the catalog, never failing
pub async fn reconcile(
    storage: &dyn VenueStorage,
    catalog: &CatalogCache,
    policy: &RetryPolicy,
    decrements: &[StockDecrement],
) -> ReconciliationReport {
    let mut report = ReconciliationReport::default();

    for decrement in decrements {
        for _ in 0..decrement.quantity {
            let key = decrement.key;
            match retry_with_backoff(policy, "decrement_stock", || storage.decrement_stock(key)).await {
                Ok(remaining) => {
                    report.decremented += 1;
                    tracing::debug!(stock_key = %key, remaining, "Stock decremented");
                },
                Err(error) => {
                    metrics::counter!("reconciliation.stock_decrement_failed").increment(1);
                    tracing::warn!(stock_key = %key, error = %error, "Stock decrement abandoned");
                    report.failures.push(StockFailure {
                        key,
                        error: error.to_string(),
                    });
                },
            }
        }
    }

    match catalog.refresh().await {
        Ok(()) => report.catalog_refreshed = true,
        Err(error) => tracing::warn!(error = %error, "Catalog refresh failed after commit"),
    }

    report
}
