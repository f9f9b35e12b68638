// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Banner domain types.
//!
//! A banner owns an append-only history of [`Version`]s and points at exactly
//! one of them (the *chosen* version). Versions are never mutated: an update
//! builds a new version by overlaying a [`BannerPatch`] onto the chosen one.
//!
//! # Example
//!
//! ```
//! use banner_engine::{NewBanner, BannerPatch};
//! use serde_json::json;
//!
//! let current = NewBanner::new(vec![1, 2], 10, json!({"a": 1}), true);
//! let next = current.overlay(&BannerPatch::default().with_content(json!({"b": 2})));
//!
//! assert_eq!(next.tag_ids, vec![1, 2]);
//! assert_eq!(next.feature_id, 10);
//! assert_eq!(next.content, json!({"b": 2}));
//! assert!(next.is_active);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::traits::StorageError;

pub type BannerId = i64;
pub type VersionId = i64;
pub type TagId = i64;
pub type FeatureId = i64;

/// Default page size for banner listings.
pub const DEFAULT_BANNER_PAGE: u32 = 15;
/// Default page size for version history listings.
pub const DEFAULT_VERSION_PAGE: u32 = 3;
/// Largest accepted page size.
pub const MAX_PAGE_LIMIT: u32 = 100;
/// Largest accepted offset; SQL backends bind offsets as signed 64-bit.
pub const MAX_PAGE_OFFSET: u64 = i64::MAX as u64;

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Collapse repeated tag ids, keeping first-seen order.
#[must_use]
pub fn dedup_tags(tags: &[TagId]) -> Vec<TagId> {
    let mut seen = std::collections::HashSet::with_capacity(tags.len());
    tags.iter().copied().filter(|t| seen.insert(*t)).collect()
}

/// The full field set of a version, used both to create a banner and as the
/// result of merging a patch onto the chosen version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBanner {
    pub tag_ids: Vec<TagId>,
    pub feature_id: FeatureId,
    pub content: Value,
    pub is_active: bool,
}

impl NewBanner {
    #[must_use]
    pub fn new(tag_ids: Vec<TagId>, feature_id: FeatureId, content: Value, is_active: bool) -> Self {
        Self {
            tag_ids,
            feature_id,
            content,
            is_active,
        }
    }

    /// Partial merge: fields present in `patch` win, the rest carry over.
    #[must_use]
    pub fn overlay(&self, patch: &BannerPatch) -> NewBanner {
        NewBanner {
            tag_ids: patch
                .tag_ids
                .as_deref()
                .map(dedup_tags)
                .unwrap_or_else(|| self.tag_ids.clone()),
            feature_id: patch.feature_id.unwrap_or(self.feature_id),
            content: patch.content.clone().unwrap_or_else(|| self.content.clone()),
            is_active: patch.is_active.unwrap_or(self.is_active),
        }
    }

    /// Reject a version that could never be resolved.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.tag_ids.is_empty() {
            return Err(StorageError::Invalid("tag_ids must not be empty".into()));
        }
        Ok(())
    }

    /// Content serialized the way stores and caches keep it.
    pub fn content_text(&self) -> Result<String, StorageError> {
        serde_json::to_string(&self.content)
            .map_err(|e| StorageError::Invalid(format!("content is not serializable: {}", e)))
    }
}

/// Partial update applied by a rotation. `None` means "keep current".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BannerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_ids: Option<Vec<TagId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<FeatureId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl BannerPatch {
    #[must_use]
    pub fn with_tags(mut self, tag_ids: Vec<TagId>) -> Self {
        self.tag_ids = Some(tag_ids);
        self
    }

    #[must_use]
    pub fn with_feature(mut self, feature_id: FeatureId) -> Self {
        self.feature_id = Some(feature_id);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    #[must_use]
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tag_ids.is_none()
            && self.feature_id.is_none()
            && self.content.is_none()
            && self.is_active.is_none()
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.is_empty() {
            return Err(StorageError::Invalid("patch carries no fields".into()));
        }
        if matches!(self.tag_ids.as_deref(), Some([])) {
            return Err(StorageError::Invalid("tag_ids must not be empty".into()));
        }
        Ok(())
    }
}

/// A stored version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: VersionId,
    pub banner_id: BannerId,
    pub tag_ids: Vec<TagId>,
    pub feature_id: FeatureId,
    pub content: Value,
    pub is_active: bool,
    /// Epoch millis
    pub created_at: i64,
    /// Epoch millis
    pub updated_at: i64,
}

impl Version {
    /// The mergeable fields of this version.
    #[must_use]
    pub fn fields(&self) -> NewBanner {
        NewBanner::new(
            self.tag_ids.clone(),
            self.feature_id,
            self.content.clone(),
            self.is_active,
        )
    }
}

/// A banner as seen through its chosen version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannerSummary {
    pub banner_id: BannerId,
    pub tag_ids: Vec<TagId>,
    pub feature_id: FeatureId,
    pub content: Value,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One entry of a banner's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version_id: VersionId,
    pub tag_ids: Vec<TagId>,
    pub feature_id: FeatureId,
    pub content: Value,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_chosen: bool,
}

/// Tag and/or feature filter over chosen versions. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BannerFilter {
    pub tag_id: Option<TagId>,
    pub feature_id: Option<FeatureId>,
}

impl BannerFilter {
    #[must_use]
    pub fn new(tag_id: Option<TagId>, feature_id: Option<FeatureId>) -> Self {
        Self { tag_id, feature_id }
    }

    #[must_use]
    pub fn by_tag(tag_id: TagId) -> Self {
        Self::new(Some(tag_id), None)
    }

    #[must_use]
    pub fn by_feature(feature_id: FeatureId) -> Self {
        Self::new(None, Some(feature_id))
    }

    /// True when neither filter is set.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.tag_id.is_none() && self.feature_id.is_none()
    }

    /// Whether a version with these fields passes the filter.
    #[must_use]
    pub fn matches(&self, tag_ids: &[TagId], feature_id: FeatureId) -> bool {
        self.feature_id.map_or(true, |f| f == feature_id)
            && self.tag_id.map_or(true, |t| tag_ids.contains(&t))
    }
}

impl std::fmt::Display for BannerFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: Option<i64>| v.map_or_else(|| "*".to_string(), |v| v.to_string());
        write!(f, "tag={} feature={}", show(self.tag_id), show(self.feature_id))
    }
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u64,
}

impl Page {
    /// Build a page, rejecting limits outside `1..=100` and offsets past `i64::MAX`.
    pub fn new(limit: u32, offset: u64) -> Result<Self, StorageError> {
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(StorageError::Invalid(format!(
                "limit should be in range [1:{}], got {}",
                MAX_PAGE_LIMIT, limit
            )));
        }
        if offset > MAX_PAGE_OFFSET {
            return Err(StorageError::Invalid(format!(
                "offset should be at most {}, got {}",
                MAX_PAGE_OFFSET, offset
            )));
        }
        Ok(Self { limit, offset })
    }

    /// Offset as a signed SQL bind value.
    pub fn sql_offset(&self) -> Result<i64, StorageError> {
        i64::try_from(self.offset)
            .map_err(|_| StorageError::Invalid(format!("offset {} out of range", self.offset)))
    }

    #[must_use]
    pub fn banners() -> Self {
        Self { limit: DEFAULT_BANNER_PAGE, offset: 0 }
    }

    #[must_use]
    pub fn versions() -> Self {
        Self { limit: DEFAULT_VERSION_PAGE, offset: 0 }
    }

    /// Slice an already-ordered sequence.
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(usize::try_from(self.offset).unwrap_or(usize::MAX))
            .take(self.limit as usize)
            .collect()
    }
}
