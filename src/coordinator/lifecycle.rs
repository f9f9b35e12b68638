// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: connect, ping, shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::BannerEngineConfig;
use crate::deletion::DrainOutcome;
use crate::storage::memory::{MemoryBannerStore, MemoryCache};
use crate::storage::redis::RedisCache;
use crate::storage::sql::SqlBannerStore;
use crate::storage::traits::{BannerStore, CacheStore};

use super::{BannerEngine, EngineError, EngineState};

impl BannerEngine {
    /// Connect to the configured backends and return a `Ready` engine.
    ///
    /// Startup flow:
    /// 1. Connect to SQL (creating the schema) or fall back to an in-memory store
    /// 2. Connect to Redis or fall back to an in-memory cache
    /// 3. Ready!
    ///
    /// Connection attempts retry with backoff for a few seconds, then fail.
    #[tracing::instrument(skip(config), fields(has_sql, has_redis))]
    pub async fn connect(config: BannerEngineConfig) -> Result<Self, EngineError> {
        let startup_start = std::time::Instant::now();

        let store: Arc<dyn BannerStore> = match config.sql_url {
            Some(ref sql_url) => {
                info!("Connecting to SQL version store...");
                let store = SqlBannerStore::with_max_connections(sql_url, config.sql_max_connections)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Failed to connect to SQL");
                        crate::metrics::set_backend_healthy("store", false);
                        EngineError::new("connect", e)
                    })?;
                tracing::Span::current().record("has_sql", true);
                crate::metrics::set_backend_healthy("store", true);
                Arc::new(store)
            }
            None => {
                warn!("No SQL URL configured - banners live in process memory only!");
                tracing::Span::current().record("has_sql", false);
                Arc::new(MemoryBannerStore::new())
            }
        };

        let cache: Arc<dyn CacheStore> = match config.redis_url {
            Some(ref redis_url) => {
                info!("Connecting to Redis cache...");
                let cache = RedisCache::with_prefix(redis_url, config.redis_prefix.as_deref())
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Failed to connect to Redis");
                        crate::metrics::set_backend_healthy("cache", false);
                        EngineError::new("connect", e)
                    })?;
                tracing::Span::current().record("has_redis", true);
                crate::metrics::set_backend_healthy("cache", true);
                Arc::new(cache)
            }
            None => {
                tracing::Span::current().record("has_redis", false);
                Arc::new(MemoryCache::new())
            }
        };

        let engine = Self::with_backends(config, store, cache);
        info!(elapsed = ?startup_start.elapsed(), "Banner engine connected");
        Ok(engine)
    }

    /// Round-trip the store and the cache.
    pub async fn ping(&self) -> Result<(), EngineError> {
        let (store, cache) = tokio::join!(self.store.ping(), self.cache.ping());

        crate::metrics::set_backend_healthy("store", store.is_ok());
        crate::metrics::set_backend_healthy("cache", cache.is_ok());

        store.map_err(|e| EngineError::new("ping", e))?;
        cache.map_err(|e| EngineError::new("ping", e))?;
        Ok(())
    }

    /// Drain background deletions and stop.
    ///
    /// Waits up to `shutdown_grace_ms` for accepted deletions. Whatever is
    /// still queued or running after that is cancelled and reported.
    /// Reads and writes keep working while the drain runs; new bulk
    /// deletions are refused from the moment it starts.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> DrainOutcome {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            warn!(state = %self.state(), "Shutdown already requested");
            return DrainOutcome::Drained;
        }

        info!(
            pending = self.pending_deletions(),
            "Initiating banner engine shutdown..."
        );
        self.set_state(EngineState::ShuttingDown);

        let outcome = self.deletions.shutdown(self.config.shutdown_grace()).await;
        match outcome {
            DrainOutcome::Drained => info!("All background deletions drained"),
            DrainOutcome::Cancelled { remaining } => {
                warn!(remaining, "Shutdown cancelled unfinished deletions")
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Banner engine shutdown complete");
        outcome
    }
}
