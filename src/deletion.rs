// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background bulk deletion with bounded concurrency and graceful drain.
//!
//! # Unit Lifecycle
//!
//! ```text
//! submit(filter)
//!   ├─ unbounded filter ──────────► Invalid
//!   ├─ exists_by_criteria = false ─► NotFound
//!   └─ Accepted ──► tracker.spawn ──► wait for permit ──► delete_by_criteria
//!                                         │                    │
//!                                         └── cancel token ────┴──► Cancelled
//! ```
//!
//! The caller gets `Ok(())` as soon as the unit is enqueued; the outcome is
//! only logged. At most `workers` units run their store call at once, the
//! rest queue on the semaphore.
//!
//! # Shutdown
//!
//! [`DeletionCoordinator::shutdown`] stops accepting new units, then waits up
//! to the grace period for every tracked unit. The accepting flag and the
//! spawn share one lock, so no unit can slip in after the drain finished. When the window closes first, the shared token is cancelled:
//! running store calls are dropped mid-flight and queued units never start.
//! Dropping a SQL delete rolls back its transaction, so each unit is either
//! fully applied or untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::banner::BannerFilter;
use crate::metrics;
use crate::storage::traits::{BannerStore, StorageError};

/// How the shutdown drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every accepted deletion finished inside the grace period.
    Drained,
    /// The grace period elapsed; `remaining` units were cancelled.
    Cancelled { remaining: usize },
}

impl DrainOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

pub struct DeletionCoordinator {
    store: Arc<dyn BannerStore>,
    permits: Arc<Semaphore>,
    workers: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    /// Cleared by `shutdown`; checked under the lock right before each spawn.
    accepting: Mutex<bool>,
}

impl DeletionCoordinator {
    /// `workers` is clamped to at least one.
    pub fn new(store: Arc<dyn BannerStore>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            store,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            accepting: Mutex::new(true),
        }
    }

    /// Ceiling on concurrently running store deletions.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Units accepted but not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// False once `shutdown` has started.
    pub fn is_accepting(&self) -> bool {
        *self.accepting.lock()
    }

    /// Validate, confirm at least one banner matches, then delete in the background.
    ///
    /// Refused with a transient error once shutdown has started.
    pub async fn submit(&self, filter: BannerFilter) -> Result<(), StorageError> {
        if filter.is_unbounded() {
            return Err(StorageError::Invalid(
                "delete by criteria needs a tag or feature filter".into(),
            ));
        }
        if !self.is_accepting() {
            return Err(shutting_down());
        }
        if !self.store.exists_by_criteria(&filter).await? {
            return Err(StorageError::NotFound);
        }

        // Shutdown may have started during the exists check
        let accepting = self.accepting.lock();
        if !*accepting {
            return Err(shutting_down());
        }
        self.enqueue(filter);
        Ok(())
    }

    fn enqueue(&self, filter: BannerFilter) {
        let pending = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_deletions_in_flight(pending);
        debug!(filter = %filter, pending, "Deletion enqueued");

        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let in_flight = Arc::clone(&self.in_flight);

        self.tracker.spawn(async move {
            let run = async {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| StorageError::Backend("deletion pool closed".into()))?;
                store.delete_by_criteria(&filter).await
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = run => Some(result),
            };

            match outcome {
                Some(Ok(deleted)) => {
                    metrics::record_deletion("completed");
                    metrics::record_deleted_banners(deleted);
                    info!(filter = %filter, deleted, "Bulk deletion completed");
                }
                // Someone else removed them between the check and the run
                Some(Err(StorageError::NotFound)) => {
                    metrics::record_deletion("completed");
                    info!(filter = %filter, "Bulk deletion found nothing left to delete");
                }
                Some(Err(e)) => {
                    metrics::record_deletion("failed");
                    error!(filter = %filter, error = %e, "Bulk deletion failed");
                }
                None => {
                    metrics::record_deletion("cancelled");
                    warn!(filter = %filter, "Bulk deletion cancelled by shutdown, may be incomplete");
                }
            }

            let pending = in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
            metrics::set_deletions_in_flight(pending);
        });
    }

    /// Wait for accepted deletions, cancelling whatever is left after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> DrainOutcome {
        let start = Instant::now();
        {
            let mut accepting = self.accepting.lock();
            *accepting = false;
            self.tracker.close();
        }

        let outcome = match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => {
                let remaining = self.in_flight();
                warn!(remaining, ?grace, "Deletion drain timed out, cancelling remaining units");
                self.cancel.cancel();
                self.tracker.wait().await;
                DrainOutcome::Cancelled { remaining }
            }
        };

        metrics::record_drain_duration(start.elapsed());
        outcome
    }
}

fn shutting_down() -> StorageError {
    StorageError::Backend("deletion coordinator is shutting down".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banner::NewBanner;
    use crate::storage::memory::MemoryBannerStore;
    use serde_json::json;

    async fn seeded() -> (Arc<MemoryBannerStore>, DeletionCoordinator) {
        let store = Arc::new(MemoryBannerStore::new());
        for (tags, feature) in [(vec![1, 2], 10), (vec![3], 10), (vec![1], 20)] {
            store
                .create_banner(&NewBanner::new(tags, feature, json!({}), true))
                .await
                .unwrap();
        }
        let coordinator = DeletionCoordinator::new(store.clone(), 2);
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_unbounded_filter_rejected() {
        let (_, coordinator) = seeded().await;
        let err = coordinator.submit(BannerFilter::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let (_, coordinator) = seeded().await;
        assert_eq!(
            coordinator.submit(BannerFilter::by_feature(99)).await,
            Err(StorageError::NotFound)
        );
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_accepted_deletion_drains() {
        let (store, coordinator) = seeded().await;

        coordinator.submit(BannerFilter::by_feature(10)).await.unwrap();
        let outcome = coordinator.shutdown(Duration::from_secs(5)).await;

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(outcome.is_clean());
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(store.banner_count(), 1);
        assert_eq!(store.resolve_active(1, 10, false).await, Err(StorageError::NotFound));
        assert!(store.resolve_active(1, 20, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_workers_clamped() {
        let store = Arc::new(MemoryBannerStore::new());
        assert_eq!(DeletionCoordinator::new(store, 0).workers(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_drain_is_refused() {
        let (store, coordinator) = seeded().await;
        assert!(coordinator.is_accepting());

        assert_eq!(
            coordinator.shutdown(Duration::from_secs(1)).await,
            DrainOutcome::Drained
        );
        assert!(!coordinator.is_accepting());

        let err = coordinator.submit(BannerFilter::by_tag(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.tracker.is_empty());
        assert_eq!(store.banner_count(), 3);
    }

    #[tokio::test]
    async fn test_submit_racing_shutdown_is_tracked_or_refused() {
        let (store, coordinator) = seeded().await;
        let coordinator = Arc::new(coordinator);

        let submitter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.submit(BannerFilter::by_feature(10)).await })
        };
        let outcome = coordinator.shutdown(Duration::from_secs(5)).await;
        let submitted = submitter.await.unwrap();

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(coordinator.tracker.is_empty());
        match submitted {
            // Accepted units finish before the drain reports
            Ok(()) => assert_eq!(store.banner_count(), 1),
            Err(e) => {
                assert!(matches!(e, StorageError::Backend(_)));
                assert_eq!(store.banner_count(), 3);
            }
        }
    }
}
