// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache backend.
//!
//! Resolved content is stored as a plain Redis STRING with a millisecond
//! expiry (`SET key value PX ttl`). Nothing is ever deleted explicitly:
//! entries age out, and callers needing current data ask for a fresh read.
//!
//! ```text
//! SET banners:1_10_false '{"a":1}' PX 300000
//! GET banners:1_10_false
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};

use super::traits::{CacheStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCache {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "banners:" → "banners:1_10_false")
    prefix: String,
}

impl RedisCache {
    /// Create a new Redis cache without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis cache with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use banner_engine::storage::redis::RedisCache;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCache::with_prefix("redis://localhost", Some("banners:")).await?;
    /// assert_eq!(cache.prefix(), "banners:");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(
        connection_string: &str,
        prefix: Option<&str>,
    ) -> Result<Self, StorageError> {
        let client =
            Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Startup schedule: a bad URL fails in seconds, not on the first read
        let connection = retry("redis", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        conn.get(self.prefixed_key(key))
            .await
            .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        // PX 0 is rejected by Redis
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let _: () = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to cache {}: {}", key, e)))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
