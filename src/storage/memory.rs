// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends.
//!
//! [`MemoryBannerStore`] keeps the whole data model behind one
//! `parking_lot::Mutex`, so every trait call is trivially atomic: all checks
//! run before the first mutation. [`MemoryCache`] is a `DashMap` with
//! per-entry deadlines.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::traits::{BannerStore, CacheStore, StorageError};
use crate::banner::{
    dedup_tags, now_millis, BannerFilter, BannerId, BannerPatch, BannerSummary, FeatureId,
    NewBanner, Page, TagId, Version, VersionId, VersionSummary,
};

struct BannerRow {
    chosen: VersionId,
    versions: Vec<VersionId>,
}

#[derive(Default)]
struct State {
    next_banner: BannerId,
    next_version: VersionId,
    banners: BTreeMap<BannerId, BannerRow>,
    versions: HashMap<VersionId, Version>,
    /// (tag, feature) → banner, derived from chosen versions
    chosen_index: HashMap<(TagId, FeatureId), BannerId>,
}

impl State {
    fn chosen(&self, banner_id: BannerId) -> Option<&Version> {
        self.banners
            .get(&banner_id)
            .and_then(|row| self.versions.get(&row.chosen))
    }

    /// Fail if any (tag, feature) pair is already claimed by another banner.
    fn check_claims(
        &self,
        owner: Option<BannerId>,
        tag_ids: &[TagId],
        feature_id: FeatureId,
    ) -> Result<(), StorageError> {
        let collides = tag_ids.iter().any(|tag| {
            self.chosen_index
                .get(&(*tag, feature_id))
                .is_some_and(|holder| Some(*holder) != owner)
        });
        if collides {
            return Err(StorageError::TagFeatureConflict);
        }
        Ok(())
    }

    fn release(&mut self, banner_id: BannerId) {
        if let Some(version) = self.chosen(banner_id).cloned() {
            for tag in &version.tag_ids {
                self.chosen_index.remove(&(*tag, version.feature_id));
            }
        }
    }

    fn claim(&mut self, banner_id: BannerId, tag_ids: &[TagId], feature_id: FeatureId) {
        for tag in tag_ids {
            self.chosen_index.insert((*tag, feature_id), banner_id);
        }
    }

    fn insert_version(
        &mut self,
        banner_id: BannerId,
        fields: NewBanner,
        created_at: i64,
    ) -> VersionId {
        self.next_version += 1;
        let version_id = self.next_version;
        self.versions.insert(
            version_id,
            Version {
                version_id,
                banner_id,
                tag_ids: fields.tag_ids,
                feature_id: fields.feature_id,
                content: fields.content,
                is_active: fields.is_active,
                created_at,
                updated_at: now_millis(),
            },
        );
        version_id
    }

    fn remove_banner(&mut self, banner_id: BannerId) -> bool {
        self.release(banner_id);
        match self.banners.remove(&banner_id) {
            Some(row) => {
                for version_id in row.versions {
                    self.versions.remove(&version_id);
                }
                true
            }
            None => false,
        }
    }

    fn matching(&self, filter: &BannerFilter) -> Vec<BannerId> {
        self.banners
            .keys()
            .copied()
            .filter(|id| {
                self.chosen(*id)
                    .is_some_and(|v| filter.matches(&v.tag_ids, v.feature_id))
            })
            .collect()
    }
}

/// Newest first, ties broken by allocation order.
fn newest_first(a: &Version, b: &Version) -> std::cmp::Ordering {
    (b.updated_at, b.version_id).cmp(&(a.updated_at, a.version_id))
}

pub struct MemoryBannerStore {
    state: Mutex<State>,
}

impl MemoryBannerStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Number of live banners
    #[must_use]
    pub fn banner_count(&self) -> usize {
        self.state.lock().banners.len()
    }

    /// Total versions across all banners
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.state.lock().versions.len()
    }

    /// Snapshot of the chosen-index, sorted by key.
    #[must_use]
    pub fn chosen_index(&self) -> Vec<((TagId, FeatureId), BannerId)> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state.chosen_index.iter().map(|(k, v)| (*k, *v)).collect();
        rows.sort_unstable();
        rows
    }
}

impl Default for MemoryBannerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BannerStore for MemoryBannerStore {
    async fn create_banner(&self, banner: &NewBanner) -> Result<BannerId, StorageError> {
        let mut fields = banner.clone();
        fields.tag_ids = dedup_tags(&fields.tag_ids);

        let mut state = self.state.lock();
        state.check_claims(None, &fields.tag_ids, fields.feature_id)?;

        state.next_banner += 1;
        let banner_id = state.next_banner;
        let (tags, feature) = (fields.tag_ids.clone(), fields.feature_id);
        let version_id = state.insert_version(banner_id, fields, now_millis());
        state.banners.insert(
            banner_id,
            BannerRow {
                chosen: version_id,
                versions: vec![version_id],
            },
        );
        state.claim(banner_id, &tags, feature);
        Ok(banner_id)
    }

    async fn rotate_version(
        &self,
        banner_id: BannerId,
        patch: &BannerPatch,
    ) -> Result<VersionId, StorageError> {
        let mut state = self.state.lock();
        let current = state
            .chosen(banner_id)
            .cloned()
            .ok_or(StorageError::BannerNotFound(banner_id))?;

        let merged = current.fields().overlay(patch);
        state.check_claims(Some(banner_id), &merged.tag_ids, merged.feature_id)?;

        let (tags, feature) = (merged.tag_ids.clone(), merged.feature_id);
        let version_id = state.insert_version(banner_id, merged, current.created_at);
        state.release(banner_id);
        if let Some(row) = state.banners.get_mut(&banner_id) {
            row.chosen = version_id;
            row.versions.push(version_id);
        }
        state.claim(banner_id, &tags, feature);
        Ok(version_id)
    }

    async fn choose_version(
        &self,
        banner_id: BannerId,
        version_id: VersionId,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !state.banners.contains_key(&banner_id) {
            return Err(StorageError::BannerNotFound(banner_id));
        }
        let target = state
            .versions
            .get(&version_id)
            .filter(|v| v.banner_id == banner_id)
            .cloned()
            .ok_or(StorageError::VersionNotFound { banner_id, version_id })?;

        state.check_claims(Some(banner_id), &target.tag_ids, target.feature_id)?;
        state.release(banner_id);
        if let Some(row) = state.banners.get_mut(&banner_id) {
            row.chosen = version_id;
        }
        state.claim(banner_id, &target.tag_ids, target.feature_id);
        Ok(())
    }

    async fn resolve_active(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        include_inactive: bool,
    ) -> Result<String, StorageError> {
        let state = self.state.lock();
        let version = state
            .chosen_index
            .get(&(tag_id, feature_id))
            .and_then(|banner_id| state.chosen(*banner_id))
            .filter(|v| v.is_active || include_inactive)
            .ok_or(StorageError::NotFound)?;
        serde_json::to_string(&version.content).map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn list_active(
        &self,
        filter: &BannerFilter,
        page: Page,
    ) -> Result<Vec<BannerSummary>, StorageError> {
        let state = self.state.lock();
        let mut chosen: Vec<&Version> = state
            .banners
            .keys()
            .filter_map(|id| state.chosen(*id))
            .filter(|v| filter.matches(&v.tag_ids, v.feature_id))
            .collect();
        chosen.sort_by(|a, b| newest_first(a, b));

        Ok(page.apply(chosen.into_iter().map(|v| BannerSummary {
            banner_id: v.banner_id,
            tag_ids: v.tag_ids.clone(),
            feature_id: v.feature_id,
            content: v.content.clone(),
            is_active: v.is_active,
            created_at: v.created_at,
            updated_at: v.updated_at,
        })))
    }

    async fn list_versions(
        &self,
        banner_id: BannerId,
        page: Page,
    ) -> Result<Vec<VersionSummary>, StorageError> {
        let state = self.state.lock();
        let row = state
            .banners
            .get(&banner_id)
            .ok_or(StorageError::BannerNotFound(banner_id))?;
        let mut history: Vec<&Version> = row
            .versions
            .iter()
            .filter_map(|id| state.versions.get(id))
            .collect();
        history.sort_by(|a, b| newest_first(a, b));

        Ok(page.apply(history.into_iter().map(|v| VersionSummary {
            version_id: v.version_id,
            tag_ids: v.tag_ids.clone(),
            feature_id: v.feature_id,
            content: v.content.clone(),
            is_active: v.is_active,
            created_at: v.created_at,
            updated_at: v.updated_at,
            is_chosen: v.version_id == row.chosen,
        })))
    }

    async fn delete_banner(&self, banner_id: BannerId) -> Result<(), StorageError> {
        if self.state.lock().remove_banner(banner_id) {
            Ok(())
        } else {
            Err(StorageError::BannerNotFound(banner_id))
        }
    }

    async fn exists_by_criteria(&self, filter: &BannerFilter) -> Result<bool, StorageError> {
        Ok(!self.state.lock().matching(filter).is_empty())
    }

    async fn delete_by_criteria(&self, filter: &BannerFilter) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        let doomed = state.matching(filter);
        if doomed.is_empty() {
            return Err(StorageError::NotFound);
        }
        for banner_id in &doomed {
            state.remove_banner(*banner_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// `DashMap` cache with lazy expiry on read.
///
/// Deadlines use `tokio::time::Instant` so paused-clock tests can step past a TTL.
pub struct MemoryCache {
    data: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Entries currently held, expired or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let hit = self
            .data
            .get(key)
            .map(|entry| (entry.value().0.clone(), entry.value().1 > now));
        match hit {
            Some((value, true)) => Ok(Some(value)),
            Some((_, false)) => {
                self.data.remove_if(key, |_, (_, deadline)| *deadline <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        self.data
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn banner(tags: Vec<TagId>, feature: FeatureId) -> NewBanner {
        NewBanner::new(tags, feature, json!({"f": feature}), true)
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let store = MemoryBannerStore::new();
        store.create_banner(&banner(vec![1, 2], 10)).await.unwrap();

        assert_eq!(store.resolve_active(1, 10, false).await.unwrap(), r#"{"f":10}"#);
        assert_eq!(store.resolve_active(2, 10, false).await.unwrap(), r#"{"f":10}"#);
        assert_eq!(store.resolve_active(3, 10, false).await, Err(StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_create_conflict_persists_nothing() {
        let store = MemoryBannerStore::new();
        store.create_banner(&banner(vec![1], 10)).await.unwrap();

        let err = store.create_banner(&banner(vec![5, 1], 10)).await.unwrap_err();
        assert_eq!(err, StorageError::TagFeatureConflict);
        assert_eq!(store.banner_count(), 1);
        assert_eq!(store.version_count(), 1);
        assert_eq!(store.resolve_active(5, 10, false).await, Err(StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_same_tag_different_feature_is_fine() {
        let store = MemoryBannerStore::new();
        store.create_banner(&banner(vec![1], 10)).await.unwrap();
        store.create_banner(&banner(vec![1], 11)).await.unwrap();
        assert_eq!(store.chosen_index().len(), 2);
    }

    #[tokio::test]
    async fn test_inactive_needs_privilege() {
        let store = MemoryBannerStore::new();
        let mut b = banner(vec![1], 10);
        b.is_active = false;
        store.create_banner(&b).await.unwrap();

        assert_eq!(store.resolve_active(1, 10, false).await, Err(StorageError::NotFound));
        assert!(store.resolve_active(1, 10, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotate_moves_index_rows() {
        let store = MemoryBannerStore::new();
        let id = store.create_banner(&banner(vec![1, 2], 10)).await.unwrap();

        store
            .rotate_version(id, &BannerPatch::default().with_tags(vec![3]))
            .await
            .unwrap();

        assert_eq!(store.chosen_index(), vec![((3, 10), id)]);
        assert_eq!(store.resolve_active(1, 10, false).await, Err(StorageError::NotFound));
        assert!(store.resolve_active(3, 10, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_rotate_conflict_leaves_state() {
        let store = MemoryBannerStore::new();
        let a = store.create_banner(&banner(vec![1], 10)).await.unwrap();
        store.create_banner(&banner(vec![2], 10)).await.unwrap();
        let before = store.chosen_index();

        let err = store
            .rotate_version(a, &BannerPatch::default().with_tags(vec![2]))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::TagFeatureConflict);
        assert_eq!(store.chosen_index(), before);
        assert_eq!(store.version_count(), 2);
    }

    #[tokio::test]
    async fn test_rotate_missing_banner() {
        let store = MemoryBannerStore::new();
        let err = store
            .rotate_version(42, &BannerPatch::default().with_active(false))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::BannerNotFound(42));
    }

    #[tokio::test]
    async fn test_choose_foreign_version_rejected() {
        let store = MemoryBannerStore::new();
        let a = store.create_banner(&banner(vec![1], 10)).await.unwrap();
        let b = store.create_banner(&banner(vec![2], 10)).await.unwrap();
        let b_version = store.list_versions(b, Page::versions()).await.unwrap()[0].version_id;

        let err = store.choose_version(a, b_version).await.unwrap_err();
        assert_eq!(err, StorageError::VersionNotFound { banner_id: a, version_id: b_version });
        assert_eq!(store.choose_version(99, b_version).await, Err(StorageError::BannerNotFound(99)));
    }

    #[tokio::test]
    async fn test_choose_back_to_old_version() {
        let store = MemoryBannerStore::new();
        let id = store.create_banner(&banner(vec![1], 10)).await.unwrap();
        let first = store.list_versions(id, Page::versions()).await.unwrap()[0].version_id;
        store
            .rotate_version(id, &BannerPatch::default().with_content(json!({"v": 2})))
            .await
            .unwrap();

        store.choose_version(id, first).await.unwrap();

        let history = store.list_versions(id, Page::versions()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().find(|v| v.version_id == first).unwrap().is_chosen);
        assert_eq!(store.resolve_active(1, 10, false).await.unwrap(), r#"{"f":10}"#);
    }

    #[tokio::test]
    async fn test_list_active_filters_and_orders() {
        let store = MemoryBannerStore::new();
        let a = store.create_banner(&banner(vec![1], 10)).await.unwrap();
        let b = store.create_banner(&banner(vec![1, 2], 11)).await.unwrap();
        let c = store.create_banner(&banner(vec![3], 11)).await.unwrap();

        let all = store.list_active(&BannerFilter::default(), Page::banners()).await.unwrap();
        assert_eq!(all.iter().map(|s| s.banner_id).collect::<Vec<_>>(), vec![c, b, a]);

        let tag1 = store.list_active(&BannerFilter::by_tag(1), Page::banners()).await.unwrap();
        assert_eq!(tag1.len(), 2);

        let both = store
            .list_active(&BannerFilter::new(Some(1), Some(11)), Page::banners())
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].banner_id, b);
        assert_eq!(both[0].tag_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_delete_banner_cascades() {
        let store = MemoryBannerStore::new();
        let id = store.create_banner(&banner(vec![1], 10)).await.unwrap();
        store
            .rotate_version(id, &BannerPatch::default().with_active(false))
            .await
            .unwrap();

        store.delete_banner(id).await.unwrap();
        assert_eq!(store.banner_count(), 0);
        assert_eq!(store.version_count(), 0);
        assert!(store.chosen_index().is_empty());
        assert_eq!(store.delete_banner(id).await, Err(StorageError::BannerNotFound(id)));
    }

    #[tokio::test]
    async fn test_delete_by_criteria() {
        let store = MemoryBannerStore::new();
        store.create_banner(&banner(vec![1], 10)).await.unwrap();
        store.create_banner(&banner(vec![2], 10)).await.unwrap();
        store.create_banner(&banner(vec![1], 11)).await.unwrap();

        assert!(store.exists_by_criteria(&BannerFilter::by_feature(10)).await.unwrap());
        assert_eq!(store.delete_by_criteria(&BannerFilter::by_feature(10)).await.unwrap(), 2);
        assert!(!store.exists_by_criteria(&BannerFilter::by_feature(10)).await.unwrap());
        assert_eq!(
            store.delete_by_criteria(&BannerFilter::by_feature(10)).await,
            Err(StorageError::NotFound)
        );
        assert_eq!(store.banner_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_set_get() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").await.unwrap().is_none());
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entry_expires() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }
}
