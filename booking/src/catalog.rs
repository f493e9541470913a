//! Read-through cache of events and products.
//!
//! Cart screens read availability from here, which is advisory only. The
//! checkout path never trusts it; it re-fetches from storage before
//! requesting payment. Reconciliation calls [`CatalogCache::refresh`] after
//! every commit.

use crate::storage::{StorageError, VenueStorage};
use crate::types::{Event, EventId, Product, ProductId};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use venue_core::environment::Clock;

#[derive(Clone, Debug)]
struct Snapshot {
    events: Vec<Event>,
    products: Vec<Product>,
    refreshed_at: DateTime<Utc>,
}

/// Cached event and product views
pub struct CatalogCache {
    storage: Arc<dyn VenueStorage>,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Option<Snapshot>>,
    refreshes: AtomicUsize,
}

impl CatalogCache {
    /// Create an empty cache; the first read loads it
    #[must_use]
    pub fn new(storage: Arc<dyn VenueStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            snapshot: RwLock::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Reload events and products from storage
    ///
    /// On failure the previous snapshot is kept.
    ///
    /// # Errors
    ///
    /// Propagates the storage failure.
    pub async fn refresh(&self) -> Result<(), StorageError> {
        let events = self.storage.list_events().await?;
        let products = self.storage.list_products().await?;

        *self.snapshot.write().await = Some(Snapshot {
            events,
            products,
            refreshed_at: self.clock.now(),
        });
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Catalog cache refreshed");
        Ok(())
    }

    /// Drop the snapshot so the next read reloads
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    /// Cached events, loading on first use
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the initial load.
    pub async fn events(&self) -> Result<Vec<Event>, StorageError> {
        Ok(self.snapshot().await?.events)
    }

    /// Cached products, loading on first use
    ///
    /// # Errors
    ///
    /// Propagates storage failures from the initial load.
    pub async fn products(&self) -> Result<Vec<Product>, StorageError> {
        Ok(self.snapshot().await?.products)
    }

    /// One cached event
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the snapshot does not contain it.
    pub async fn event(&self, id: EventId) -> Result<Event, StorageError> {
        self.snapshot()
            .await?
            .events
            .into_iter()
            .find(|event| event.id == id)
            .ok_or_else(|| StorageError::not_found("Event", id))
    }

    /// One cached product
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the snapshot does not contain it.
    pub async fn product(&self, id: ProductId) -> Result<Product, StorageError> {
        self.snapshot()
            .await?
            .products
            .into_iter()
            .find(|product| product.id == id)
            .ok_or_else(|| StorageError::not_found("Product", id))
    }

    /// When the snapshot was last loaded
    pub async fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().await.as_ref().map(|snapshot| snapshot.refreshed_at)
    }

    /// Successful refreshes so far
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(snapshot.clone());
        }
        self.refresh().await?;
        self.snapshot
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::Unavailable("catalog snapshot missing after refresh".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::Money;
    use venue_testing::test_clock;

    #[tokio::test]
    async fn test_reads_are_cached_until_refresh() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = CatalogCache::new(storage.clone(), Arc::new(test_clock()));

        assert!(cache.products().await.unwrap().is_empty());
        assert_eq!(cache.refresh_count(), 1);

        storage
            .save_product(Product::new("Tape", Money::from_pence(450), 4))
            .await
            .unwrap();
        assert!(cache.products().await.unwrap().is_empty());

        cache.refresh().await.unwrap();
        assert_eq!(cache.products().await.unwrap().len(), 1);
        assert_eq!(cache.refreshed_at().await, Some(test_clock().now()));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let storage = Arc::new(InMemoryStorage::new());
        let product = Product::new("Tape", Money::from_pence(450), 4);
        storage.save_product(product.clone()).await.unwrap();
        let cache = CatalogCache::new(storage.clone(), Arc::new(test_clock()));
        cache.refresh().await.unwrap();

        storage.set_unavailable(true);
        assert!(cache.refresh().await.is_err());

        assert_eq!(cache.product(product.id).await.unwrap(), product);
    }
}
