// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-coalesced read path for active banner content.
//!
//! # Read Path
//!
//! ```text
//! resolve(tag, feature, opts)
//!   │
//!   ├─ opts.fresh ──────────────► store ──► repopulate ──► content
//!   │
//!   ├─ cache lookup ── hit ─────────────────────────────► content
//!   │      │
//!   │      ├─ miss ──┐
//!   │      └─ error ─┤ (logged, no write-back)
//!   │                ▼
//!   └─ InFlightGroup[key] ── leader ──► store ──► cache.set ──► shared result
//!                        └─ joined ─────────────────────────► shared result
//! ```
//!
//! Writes never invalidate the cache. After a rotation, readers may see the
//! previous content for up to one TTL; callers that need the current
//! version pass [`ReadOptions::fresh`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::banner::{FeatureId, TagId};
use crate::coalesce::InFlightGroup;
use crate::metrics;
use crate::storage::traits::{BannerStore, CacheStore, StorageError};

/// Cache key for one (tag, feature, privilege) combination.
#[must_use]
pub fn cache_key(tag_id: TagId, feature_id: FeatureId, include_inactive: bool) -> String {
    format!("{}_{}_{}", tag_id, feature_id, include_inactive)
}

/// Per-request read switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Privileged read: inactive chosen versions are served too.
    pub include_inactive: bool,
    /// Skip the cache and read straight from the store.
    pub fresh: bool,
}

impl ReadOptions {
    #[must_use]
    pub fn privileged() -> Self {
        Self {
            include_inactive: true,
            fresh: false,
        }
    }

    #[must_use]
    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }
}

pub struct ReadResolver {
    store: Arc<dyn BannerStore>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    flights: InFlightGroup<String, Result<String, StorageError>>,
}

impl ReadResolver {
    pub fn new(store: Arc<dyn BannerStore>, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache,
            ttl,
            flights: InFlightGroup::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Keys with a store fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Serialized content of the chosen version for (tag, feature).
    pub async fn resolve(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        opts: ReadOptions,
    ) -> Result<String, StorageError> {
        let key = cache_key(tag_id, feature_id, opts.include_inactive);

        if opts.fresh {
            metrics::record_fresh_read();
            let content = self
                .store
                .resolve_active(tag_id, feature_id, opts.include_inactive)
                .await?;
            self.repopulate(&key, &content).await;
            return Ok(content);
        }

        let write_back = match self.cache.get(&key).await {
            Ok(Some(content)) => {
                metrics::record_cache_lookup("hit");
                return Ok(content);
            }
            Ok(None) => {
                metrics::record_cache_lookup("miss");
                true
            }
            Err(e) => {
                metrics::record_cache_lookup("error");
                warn!(key = %key, error = %e, "Cache lookup failed, reading through to store");
                false
            }
        };

        let this = self;
        let key_ref = key.as_str();
        let flight = self
            .flights
            .run(key.clone(), move || async move {
                let result = this
                    .store
                    .resolve_active(tag_id, feature_id, opts.include_inactive)
                    .await;
                if let Ok(content) = &result {
                    if write_back {
                        this.repopulate(key_ref, content).await;
                    }
                }
                result
            })
            .await;

        if flight.joined {
            metrics::record_coalesced_wait();
            debug!(key = %key, "Joined in-flight fetch");
        }
        flight.value
    }

    /// Cache a store result. Failures are logged, never surfaced.
    async fn repopulate(&self, key: &str, content: &str) {
        if let Err(e) = self.cache.set(key, content, self.ttl).await {
            metrics::record_cache_write_error();
            warn!(key = %key, error = %e, "Failed to cache resolved content");
        }
    }
}
