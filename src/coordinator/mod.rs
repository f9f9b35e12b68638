// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Banner engine coordinator.
//!
//! The [`BannerEngine`] ties the components together:
//! - a [`BannerStore`] holding versions and the chosen-index
//! - a [`CacheStore`] fronting resolved content
//! - the [`ReadResolver`] coalescing concurrent cache misses
//! - the [`DeletionCoordinator`] running bulk deletes in the background
//!
//! # Lifecycle
//!
//! ```text
//! Created → Ready → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust
//! use banner_engine::{BannerEngine, BannerEngineConfig, EngineState, NewBanner, ReadOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // No sql_url / redis_url: both backends live in process memory
//! let engine = BannerEngine::connect(BannerEngineConfig::default()).await?;
//! assert_eq!(engine.state(), EngineState::Ready);
//!
//! engine.create_banner(NewBanner::new(vec![1, 2], 10, json!({"a": 1}), true)).await?;
//! let content = engine.resolve_active(1, 10, ReadOptions::default()).await?;
//! assert_eq!(content, r#"{"a":1}"#);
//!
//! engine.shutdown().await;
//! assert_eq!(engine.state(), EngineState::Stopped);
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineError, EngineState};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::BannerEngineConfig;
use crate::deletion::DeletionCoordinator;
use crate::resolver::ReadResolver;
use crate::storage::traits::{BannerStore, CacheStore, StorageError};

/// Main banner engine.
///
/// `Send + Sync`; share it behind an `Arc` between request handlers. The only
/// engine-owned mutable state is the resolver's in-flight map and the
/// deletion tracker, both safe under concurrent use.
pub struct BannerEngine {
    pub(super) config: BannerEngineConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) store: Arc<dyn BannerStore>,

    pub(super) cache: Arc<dyn CacheStore>,

    /// Cache-coalesced read path
    pub(super) resolver: ReadResolver,

    /// Background bulk deletes
    pub(super) deletions: DeletionCoordinator,
}

impl BannerEngine {
    /// Wire an engine around already-connected backends.
    ///
    /// The engine is `Ready` on return. Use [`connect()`](Self::connect) to
    /// build backends from the config instead.
    pub fn with_backends(
        config: BannerEngineConfig,
        store: Arc<dyn BannerStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let resolver = ReadResolver::new(Arc::clone(&store), Arc::clone(&cache), config.cache_ttl());
        let deletions = DeletionCoordinator::new(Arc::clone(&store), config.delete_workers);

        let engine = Self {
            config,
            state: state_tx,
            state_rx,
            store,
            cache,
            resolver,
            deletions,
        };
        engine.set_state(EngineState::Ready);
        info!(
            cache_ttl_ms = engine.config.cache_ttl_ms,
            delete_workers = engine.deletions.workers(),
            "Banner engine ready"
        );
        engine
    }

    pub fn config(&self) -> &BannerEngineConfig {
        &self.config
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is serving requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready)
    }

    /// Bulk deletions accepted but not yet finished.
    #[must_use]
    pub fn pending_deletions(&self) -> usize {
        self.deletions.in_flight()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    /// Refuse work once the drain has finished.
    pub(super) fn ensure_serving(&self, op: &'static str) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Stopped => Err(EngineError::new(
                op,
                StorageError::Backend("engine is stopped".into()),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryBannerStore, MemoryCache};

    fn engine() -> BannerEngine {
        BannerEngine::with_backends(
            BannerEngineConfig::default(),
            Arc::new(MemoryBannerStore::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    #[test]
    fn test_with_backends_is_ready() {
        let engine = engine();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.is_ready());
        assert_eq!(engine.pending_deletions(), 0);
    }

    #[test]
    fn test_stopped_engine_refuses_work() {
        let engine = engine();
        engine.set_state(EngineState::Stopped);
        let err = engine.ensure_serving("list_active").unwrap_err();
        assert_eq!(err.op, "list_active");
        assert_eq!(err.kind(), crate::storage::traits::ErrorKind::Transient);
    }
}
