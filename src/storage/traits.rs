// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::banner::{
    BannerFilter, BannerId, BannerPatch, BannerSummary, FeatureId, NewBanner, Page, TagId,
    VersionId, VersionSummary,
};

/// Failure reported by a version store or cache backend.
///
/// `Clone` so a single coalesced read result can be handed to every caller
/// that joined the in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("banner {0} not found")]
    BannerNotFound(BannerId),
    #[error("version {version_id} does not exist for banner {banner_id}")]
    VersionNotFound {
        banner_id: BannerId,
        version_id: VersionId,
    },
    #[error("requested banner not found")]
    NotFound,
    #[error("feature and tag pair of chosen banners cannot point to different banners")]
    TagFeatureConflict,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Coarse classification the HTTP layer maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Transient,
    Invalid,
}

impl StorageError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BannerNotFound(_) | Self::VersionNotFound { .. } | Self::NotFound => {
                ErrorKind::NotFound
            }
            Self::TagFeatureConflict => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::Invalid,
            Self::Backend(_) => ErrorKind::Transient,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Transient => write!(f, "transient"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// Persistent banner/version store.
///
/// Every mutating call is one atomic unit: either all of its rows land or
/// none do. Implementations must refuse a chosen-index row that would give a
/// second banner the same (tag, feature) pair.
#[async_trait]
pub trait BannerStore: Send + Sync {
    /// Insert a banner with its first version and chosen-index rows.
    async fn create_banner(&self, banner: &NewBanner) -> Result<BannerId, StorageError>;

    /// Append a version built from the chosen one overlaid with `patch`
    /// and point the banner at it.
    async fn rotate_version(
        &self,
        banner_id: BannerId,
        patch: &BannerPatch,
    ) -> Result<VersionId, StorageError>;

    /// Point the banner at one of its existing versions.
    async fn choose_version(
        &self,
        banner_id: BannerId,
        version_id: VersionId,
    ) -> Result<(), StorageError>;

    /// Serialized content of the chosen version claiming (tag, feature).
    async fn resolve_active(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        include_inactive: bool,
    ) -> Result<String, StorageError>;

    /// Chosen versions, most recently updated first.
    async fn list_active(
        &self,
        filter: &BannerFilter,
        page: Page,
    ) -> Result<Vec<BannerSummary>, StorageError>;

    /// Full history of one banner, most recent first.
    async fn list_versions(
        &self,
        banner_id: BannerId,
        page: Page,
    ) -> Result<Vec<VersionSummary>, StorageError>;

    async fn delete_banner(&self, banner_id: BannerId) -> Result<(), StorageError>;

    /// Whether any chosen version matches the filter.
    async fn exists_by_criteria(&self, filter: &BannerFilter) -> Result<bool, StorageError>;

    /// Cascade-delete every banner whose chosen version matches.
    /// Returns [`StorageError::NotFound`] when nothing matched.
    async fn delete_by_criteria(&self, filter: &BannerFilter) -> Result<u64, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

/// TTL-bounded key/value cache for resolved content.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StorageError::BannerNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            StorageError::VersionNotFound { banner_id: 1, version_id: 2 }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(StorageError::TagFeatureConflict.kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::Backend("down".into()).kind(), ErrorKind::Transient);
        assert_eq!(StorageError::Invalid("x".into()).kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(StorageError::BannerNotFound(7).to_string(), "banner 7 not found");
        assert_eq!(ErrorKind::Conflict.to_string(), "conflict");
    }
}
