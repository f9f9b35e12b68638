// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine operations: reads, the write pipeline, and deletions.
//!
//! Every call is tagged with its operation name, timed, counted, and any
//! failure comes back as an [`EngineError`] carrying that name:
//! - `resolve_active()` - coalesced, cached content lookup
//! - `list_active()` / `list_versions()` - paged listings straight from the store
//! - `create_banner()` / `rotate_version()` / `choose_version()` - atomic writes
//! - `delete_banner()` - synchronous cascade by id
//! - `delete_by_criteria()` - validated, then deleted in the background

use std::future::Future;

use tracing::{debug, instrument};

use crate::banner::{
    dedup_tags, BannerFilter, BannerId, BannerPatch, BannerSummary, FeatureId, NewBanner, Page,
    TagId, VersionId, VersionSummary,
};
use crate::metrics::{self, LatencyTimer};
use crate::resolver::ReadOptions;
use crate::storage::traits::StorageError;

use super::{BannerEngine, EngineError};

impl BannerEngine {
    /// Time and count one operation, attaching its name to any error.
    async fn observe<T, Fut>(&self, op: &'static str, work: Fut) -> Result<T, EngineError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.ensure_serving(op)?;
        let _timer = LatencyTimer::new(op);

        match work.await {
            Ok(value) => {
                metrics::record_operation(op, "success");
                Ok(value)
            }
            Err(e) => {
                metrics::record_operation(op, "error");
                metrics::record_error(op, e.kind());
                debug!(op, error = %e, kind = %e.kind(), "Operation failed");
                Err(EngineError::new(op, e))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    /// Serialized content of the chosen version claiming (tag, feature).
    ///
    /// Served from the cache when possible; concurrent misses for the same
    /// key share one store query. Content may lag a rotation by up to one
    /// cache TTL unless `opts.fresh` is set.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use banner_engine::{BannerEngine, ReadOptions};
    /// # async fn example(engine: &BannerEngine) -> Result<(), banner_engine::EngineError> {
    /// let cached = engine.resolve_active(1, 10, ReadOptions::default()).await?;
    /// let current = engine.resolve_active(1, 10, ReadOptions::default().fresh()).await?;
    /// let draft = engine.resolve_active(1, 10, ReadOptions::privileged()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn resolve_active(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        opts: ReadOptions,
    ) -> Result<String, EngineError> {
        self.observe(
            "resolve_active",
            self.resolver.resolve(tag_id, feature_id, opts),
        )
        .await
    }

    /// Like [`resolve_active`](Self::resolve_active), parsed back into JSON.
    pub async fn resolve_content(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        opts: ReadOptions,
    ) -> Result<serde_json::Value, EngineError> {
        let text = self.resolve_active(tag_id, feature_id, opts).await?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::new(
                "resolve_content",
                StorageError::Backend(format!("corrupt cached content: {}", e)),
            )
        })
    }

    /// Chosen versions matching the filter, most recently updated first.
    pub async fn list_active(
        &self,
        filter: BannerFilter,
        page: Page,
    ) -> Result<Vec<BannerSummary>, EngineError> {
        self.observe("list_active", self.store.list_active(&filter, page))
            .await
    }

    /// A banner's version history, most recent first.
    pub async fn list_versions(
        &self,
        banner_id: BannerId,
        page: Page,
    ) -> Result<Vec<VersionSummary>, EngineError> {
        self.observe("list_versions", self.store.list_versions(banner_id, page))
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Write pipeline
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create a banner with its first version.
    ///
    /// Fails with a `Conflict` kind when another banner's chosen version
    /// already claims one of the (tag, feature) pairs.
    #[instrument(skip(self, banner), fields(feature_id = banner.feature_id))]
    pub async fn create_banner(&self, mut banner: NewBanner) -> Result<BannerId, EngineError> {
        self.observe("create_banner", async {
            banner.validate()?;
            banner.tag_ids = dedup_tags(&banner.tag_ids);
            self.store.create_banner(&banner).await
        })
        .await
    }

    /// Append a version merged from the chosen one and `patch`, and choose it.
    ///
    /// Fields absent from the patch carry over; `created_at` is inherited.
    #[instrument(skip(self, patch))]
    pub async fn rotate_version(
        &self,
        banner_id: BannerId,
        patch: BannerPatch,
    ) -> Result<VersionId, EngineError> {
        self.observe("rotate_version", async {
            patch.validate()?;
            self.store.rotate_version(banner_id, &patch).await
        })
        .await
    }

    /// Point a banner back at one of its existing versions.
    #[instrument(skip(self))]
    pub async fn choose_version(
        &self,
        banner_id: BannerId,
        version_id: VersionId,
    ) -> Result<(), EngineError> {
        self.observe(
            "choose_version",
            self.store.choose_version(banner_id, version_id),
        )
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Deletion
    // ═══════════════════════════════════════════════════════════════════════════

    /// Delete one banner with its whole history, synchronously.
    #[instrument(skip(self))]
    pub async fn delete_banner(&self, banner_id: BannerId) -> Result<(), EngineError> {
        self.observe("delete_banner", self.store.delete_banner(banner_id))
            .await
    }

    /// Accept a bulk delete; the cascade runs in the background.
    ///
    /// Returns once at least one matching banner is confirmed. `NotFound`
    /// when nothing matches, `Invalid` when neither filter is set.
    #[instrument(skip(self), fields(filter = %filter))]
    pub async fn delete_by_criteria(&self, filter: BannerFilter) -> Result<(), EngineError> {
        self.observe("delete_by_criteria", self.deletions.submit(filter))
            .await
    }
}
