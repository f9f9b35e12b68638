// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL version store.
//!
//! Four tables, mirrored for SQLite and MySQL:
//! ```sql
//! banners(banner_id PK, chosen_version_id NULL)
//! banner_versions(version_id PK, banner_id, feature_id, content, is_active, created_at, updated_at)
//! banner_version_tags(version_id, tag_id, position, PK(version_id, tag_id))
//! chosen_versions(banner_id, version_id, feature_id, tag_id, UNIQUE(feature_id, tag_id))
//! ```
//!
//! `chosen_versions` is the chosen-index: one row per tag of each banner's
//! chosen version. Its `UNIQUE(feature_id, tag_id)` constraint is what keeps
//! two banners from claiming the same pair; a violation inside a write
//! transaction rolls the whole operation back and surfaces as
//! [`StorageError::TagFeatureConflict`].
//!
//! Deletes cascade by hand inside a transaction rather than through foreign
//! keys, which SQLite only enforces per-connection.
//!
//! ## sqlx Any Driver Quirks
//!
//! Booleans are stored as integers and `content` as TEXT/LONGTEXT. MySQL
//! LONGTEXT comes back through `Any` as bytes, so text columns are read as
//! `String` first and `Vec<u8>` second.
//!
//! `AnyQueryResult::last_insert_id()` is always `None` for SQLite, so new ids
//! are read back with the backend's own function on the same connection.
//!
//! ## Write transactions
//!
//! On SQLite every write transaction opens with `BEGIN IMMEDIATE`. A deferred
//! transaction that reads first and writes later cannot wait for the write
//! lock: SQLite fails the upgrade with `SQLITE_BUSY` without consulting the
//! busy timeout. Taking the lock up front makes concurrent writers queue on
//! the busy timeout (5s, the sqlx default) instead.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, instrument};

use super::traits::{BannerStore, StorageError};
use crate::banner::{
    dedup_tags, now_millis, BannerFilter, BannerId, BannerPatch, BannerSummary, FeatureId,
    NewBanner, Page, TagId, Version, VersionId, VersionSummary,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS banners (
        banner_id INTEGER PRIMARY KEY AUTOINCREMENT,
        chosen_version_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS banner_versions (
        version_id INTEGER PRIMARY KEY AUTOINCREMENT,
        banner_id INTEGER NOT NULL,
        feature_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        is_active INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_banner_versions_banner ON banner_versions (banner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS banner_version_tags (
        version_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (version_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chosen_versions (
        banner_id INTEGER NOT NULL,
        version_id INTEGER NOT NULL,
        feature_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        UNIQUE (feature_id, tag_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chosen_versions_banner ON chosen_versions (banner_id)",
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS banners (
        banner_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        chosen_version_id BIGINT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS banner_versions (
        version_id BIGINT PRIMARY KEY AUTO_INCREMENT,
        banner_id BIGINT NOT NULL,
        feature_id BIGINT NOT NULL,
        content LONGTEXT NOT NULL,
        is_active BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        INDEX idx_banner_versions_banner (banner_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS banner_version_tags (
        version_id BIGINT NOT NULL,
        tag_id BIGINT NOT NULL,
        position BIGINT NOT NULL,
        PRIMARY KEY (version_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chosen_versions (
        banner_id BIGINT NOT NULL,
        version_id BIGINT NOT NULL,
        feature_id BIGINT NOT NULL,
        tag_id BIGINT NOT NULL,
        UNIQUE KEY uq_chosen_feature_tag (feature_id, tag_id),
        INDEX idx_chosen_versions_banner (banner_id)
    )
    "#,
];

const SQLITE_LAST_ID: &str = "SELECT last_insert_rowid()";
// LAST_INSERT_ID() is BIGINT UNSIGNED; Any decodes ids as i64
const MYSQL_LAST_ID: &str = "SELECT CAST(LAST_INSERT_ID() AS SIGNED)";

const MATCHING_BANNERS: &str = "SELECT DISTINCT cv.banner_id FROM chosen_versions cv \
     WHERE (? IS NULL OR cv.feature_id = ?) AND (? IS NULL OR cv.tag_id = ?)";

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Unique violations on the chosen-index are conflicts; everything else is transient.
fn claim_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::TagFeatureConflict,
        _ => backend_err(e),
    }
}

fn text_column(row: &AnyRow, name: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(name).or_else(|_| {
        row.try_get::<Vec<u8>, _>(name)
            .map_err(backend_err)
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| StorageError::Backend(e.to_string())))
    })
}

fn int_column(row: &AnyRow, name: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(name).map_err(backend_err)
}

fn parse_content(text: &str) -> Result<serde_json::Value, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::Backend(format!("corrupt content: {}", e)))
}

pub struct SqlBannerStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlBannerStore {
    /// Connect with startup-mode retry and create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_max_connections(connection_string, 20).await
    }

    pub async fn with_max_connections(
        connection_string: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend_err)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    /// Open a write transaction holding the database write lock on SQLite.
    async fn begin_write(&self) -> Result<Transaction<'static, Any>, StorageError> {
        let tx = if self.is_sqlite {
            self.pool.begin_with("BEGIN IMMEDIATE").await
        } else {
            self.pool.begin().await
        };
        tx.map_err(backend_err)
    }

    /// Id generated by the last INSERT on this connection.
    async fn inserted_id(conn: &mut AnyConnection, is_sqlite: bool) -> Result<i64, StorageError> {
        let sql = if is_sqlite { SQLITE_LAST_ID } else { MYSQL_LAST_ID };
        let id: i64 = sqlx::query_scalar(sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(backend_err)?;

        // Both functions return 0 when nothing was inserted
        if id <= 0 {
            return Err(StorageError::Backend(format!("no generated id after insert ({})", sql)));
        }
        Ok(id)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };

        for sql in statements {
            retry("sql_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(backend_err)
            })
            .await?;
        }

        Ok(())
    }

    async fn chosen_pointer(
        conn: &mut AnyConnection,
        banner_id: BannerId,
    ) -> Result<VersionId, StorageError> {
        let row = sqlx::query("SELECT chosen_version_id FROM banners WHERE banner_id = ?")
            .bind(banner_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(backend_err)?;

        // A NULL pointer only exists inside an uncommitted create.
        row.map(|r| r.try_get::<Option<i64>, _>("chosen_version_id").map_err(backend_err))
            .transpose()?
            .flatten()
            .ok_or(StorageError::BannerNotFound(banner_id))
    }

    async fn load_tags(
        conn: &mut AnyConnection,
        version_id: VersionId,
    ) -> Result<Vec<TagId>, StorageError> {
        let rows = sqlx::query(
            "SELECT tag_id FROM banner_version_tags WHERE version_id = ? ORDER BY position",
        )
        .bind(version_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(backend_err)?;

        rows.iter().map(|r| int_column(r, "tag_id")).collect()
    }

    /// Load a version, requiring it to belong to `banner_id`.
    async fn load_version(
        conn: &mut AnyConnection,
        banner_id: BannerId,
        version_id: VersionId,
    ) -> Result<Version, StorageError> {
        let row = sqlx::query(
            "SELECT feature_id, content, is_active, created_at, updated_at \
             FROM banner_versions WHERE version_id = ? AND banner_id = ?",
        )
        .bind(version_id)
        .bind(banner_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend_err)?
        .ok_or(StorageError::VersionNotFound { banner_id, version_id })?;

        let tag_ids = Self::load_tags(conn, version_id).await?;
        Ok(Version {
            version_id,
            banner_id,
            tag_ids,
            feature_id: int_column(&row, "feature_id")?,
            content: parse_content(&text_column(&row, "content")?)?,
            is_active: int_column(&row, "is_active")? != 0,
            created_at: int_column(&row, "created_at")?,
            updated_at: int_column(&row, "updated_at")?,
        })
    }

    async fn insert_version(
        conn: &mut AnyConnection,
        is_sqlite: bool,
        banner_id: BannerId,
        fields: &NewBanner,
        created_at: i64,
    ) -> Result<VersionId, StorageError> {
        let content = fields.content_text()?;
        sqlx::query(
            "INSERT INTO banner_versions (banner_id, feature_id, content, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(banner_id)
        .bind(fields.feature_id)
        .bind(content)
        .bind(i64::from(fields.is_active))
        .bind(created_at)
        .bind(now_millis())
        .execute(&mut *conn)
        .await
        .map_err(backend_err)?;

        let version_id = Self::inserted_id(conn, is_sqlite).await?;

        for (position, tag_id) in dedup_tags(&fields.tag_ids).into_iter().enumerate() {
            sqlx::query("INSERT INTO banner_version_tags (version_id, tag_id, position) VALUES (?, ?, ?)")
                .bind(version_id)
                .bind(tag_id)
                .bind(position as i64)
                .execute(&mut *conn)
                .await
                .map_err(backend_err)?;
        }

        Ok(version_id)
    }

    /// Replace the banner's chosen-index rows and move its pointer.
    async fn repoint(
        conn: &mut AnyConnection,
        banner_id: BannerId,
        version_id: VersionId,
        tag_ids: &[TagId],
        feature_id: FeatureId,
    ) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM chosen_versions WHERE banner_id = ?")
            .bind(banner_id)
            .execute(&mut *conn)
            .await
            .map_err(backend_err)?;

        for tag_id in dedup_tags(tag_ids) {
            sqlx::query(
                "INSERT INTO chosen_versions (banner_id, version_id, feature_id, tag_id) VALUES (?, ?, ?, ?)",
            )
            .bind(banner_id)
            .bind(version_id)
            .bind(feature_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await
            .map_err(claim_err)?;
        }

        sqlx::query("UPDATE banners SET chosen_version_id = ? WHERE banner_id = ?")
            .bind(version_id)
            .bind(banner_id)
            .execute(&mut *conn)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    /// Delete a banner with its versions, tags and index rows.
    /// Returns the number of banner rows removed.
    async fn purge(conn: &mut AnyConnection, banner_id: BannerId) -> Result<u64, StorageError> {
        for sql in [
            "DELETE FROM chosen_versions WHERE banner_id = ?",
            "DELETE FROM banner_version_tags WHERE version_id IN \
             (SELECT version_id FROM banner_versions WHERE banner_id = ?)",
            "DELETE FROM banner_versions WHERE banner_id = ?",
        ] {
            sqlx::query(sql)
                .bind(banner_id)
                .execute(&mut *conn)
                .await
                .map_err(backend_err)?;
        }

        let result = sqlx::query("DELETE FROM banners WHERE banner_id = ?")
            .bind(banner_id)
            .execute(&mut *conn)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    async fn matching_banners(
        conn: &mut AnyConnection,
        filter: &BannerFilter,
        limit: Option<i64>,
    ) -> Result<Vec<BannerId>, StorageError> {
        let sql = match limit {
            Some(_) => format!("{} LIMIT ?", MATCHING_BANNERS),
            None => MATCHING_BANNERS.to_string(),
        };
        let mut query = sqlx::query(&sql)
            .bind(filter.feature_id)
            .bind(filter.feature_id)
            .bind(filter.tag_id)
            .bind(filter.tag_id);
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&mut *conn).await.map_err(backend_err)?;
        rows.iter().map(|r| int_column(r, "banner_id")).collect()
    }
}

#[async_trait]
impl BannerStore for SqlBannerStore {
    #[instrument(skip(self, banner), fields(feature_id = banner.feature_id))]
    async fn create_banner(&self, banner: &NewBanner) -> Result<BannerId, StorageError> {
        let mut tx = self.begin_write().await?;

        sqlx::query("INSERT INTO banners (chosen_version_id) VALUES (NULL)")
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        let banner_id = Self::inserted_id(&mut tx, self.is_sqlite).await?;

        let version_id =
            Self::insert_version(&mut tx, self.is_sqlite, banner_id, banner, now_millis()).await?;
        Self::repoint(&mut tx, banner_id, version_id, &banner.tag_ids, banner.feature_id).await?;

        tx.commit().await.map_err(backend_err)?;
        debug!(banner_id, version_id, "banner created");
        Ok(banner_id)
    }

    #[instrument(skip(self, patch))]
    async fn rotate_version(
        &self,
        banner_id: BannerId,
        patch: &BannerPatch,
    ) -> Result<VersionId, StorageError> {
        let mut tx = self.begin_write().await?;

        let chosen = Self::chosen_pointer(&mut tx, banner_id).await?;
        let current = Self::load_version(&mut tx, banner_id, chosen).await?;
        let merged = current.fields().overlay(patch);

        let version_id = Self::insert_version(
            &mut tx,
            self.is_sqlite,
            banner_id,
            &merged,
            current.created_at,
        )
        .await?;
        Self::repoint(&mut tx, banner_id, version_id, &merged.tag_ids, merged.feature_id).await?;

        tx.commit().await.map_err(backend_err)?;
        debug!(banner_id, from = chosen, to = version_id, "version rotated");
        Ok(version_id)
    }

    #[instrument(skip(self))]
    async fn choose_version(
        &self,
        banner_id: BannerId,
        version_id: VersionId,
    ) -> Result<(), StorageError> {
        let mut tx = self.begin_write().await?;

        Self::chosen_pointer(&mut tx, banner_id).await?;
        let target = Self::load_version(&mut tx, banner_id, version_id).await?;
        Self::repoint(&mut tx, banner_id, version_id, &target.tag_ids, target.feature_id).await?;

        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }

    async fn resolve_active(
        &self,
        tag_id: TagId,
        feature_id: FeatureId,
        include_inactive: bool,
    ) -> Result<String, StorageError> {
        let row = sqlx::query(
            "SELECT bv.content FROM chosen_versions cv \
             JOIN banner_versions bv ON bv.version_id = cv.version_id \
             WHERE cv.tag_id = ? AND cv.feature_id = ? AND (bv.is_active = 1 OR ? = 1)",
        )
        .bind(tag_id)
        .bind(feature_id)
        .bind(i64::from(include_inactive))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?
        .ok_or(StorageError::NotFound)?;

        text_column(&row, "content")
    }

    async fn list_active(
        &self,
        filter: &BannerFilter,
        page: Page,
    ) -> Result<Vec<BannerSummary>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend_err)?;

        let rows = sqlx::query(
            "SELECT b.banner_id, bv.version_id, bv.feature_id, bv.content, bv.is_active, bv.created_at, bv.updated_at \
             FROM banners b JOIN banner_versions bv ON bv.version_id = b.chosen_version_id \
             WHERE (? IS NULL OR bv.feature_id = ?) \
               AND (? IS NULL OR EXISTS (SELECT 1 FROM banner_version_tags t WHERE t.version_id = bv.version_id AND t.tag_id = ?)) \
             ORDER BY bv.updated_at DESC, bv.version_id DESC LIMIT ? OFFSET ?",
        )
        .bind(filter.feature_id)
        .bind(filter.feature_id)
        .bind(filter.tag_id)
        .bind(filter.tag_id)
        .bind(i64::from(page.limit))
        .bind(page.sql_offset()?)
        .fetch_all(&mut *conn)
        .await
        .map_err(backend_err)?;

        let mut banners = Vec::with_capacity(rows.len());
        for row in &rows {
            let version_id = int_column(row, "version_id")?;
            banners.push(BannerSummary {
                banner_id: int_column(row, "banner_id")?,
                tag_ids: Self::load_tags(&mut conn, version_id).await?,
                feature_id: int_column(row, "feature_id")?,
                content: parse_content(&text_column(row, "content")?)?,
                is_active: int_column(row, "is_active")? != 0,
                created_at: int_column(row, "created_at")?,
                updated_at: int_column(row, "updated_at")?,
            });
        }
        Ok(banners)
    }

    async fn list_versions(
        &self,
        banner_id: BannerId,
        page: Page,
    ) -> Result<Vec<VersionSummary>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend_err)?;
        let chosen = Self::chosen_pointer(&mut conn, banner_id).await?;

        let rows = sqlx::query(
            "SELECT version_id, feature_id, content, is_active, created_at, updated_at \
             FROM banner_versions WHERE banner_id = ? \
             ORDER BY updated_at DESC, version_id DESC LIMIT ? OFFSET ?",
        )
        .bind(banner_id)
        .bind(i64::from(page.limit))
        .bind(page.sql_offset()?)
        .fetch_all(&mut *conn)
        .await
        .map_err(backend_err)?;

        let mut versions = Vec::with_capacity(rows.len());
        for row in &rows {
            let version_id = int_column(row, "version_id")?;
            versions.push(VersionSummary {
                version_id,
                tag_ids: Self::load_tags(&mut conn, version_id).await?,
                feature_id: int_column(row, "feature_id")?,
                content: parse_content(&text_column(row, "content")?)?,
                is_active: int_column(row, "is_active")? != 0,
                created_at: int_column(row, "created_at")?,
                updated_at: int_column(row, "updated_at")?,
                is_chosen: version_id == chosen,
            });
        }
        Ok(versions)
    }

    #[instrument(skip(self))]
    async fn delete_banner(&self, banner_id: BannerId) -> Result<(), StorageError> {
        let mut tx = self.begin_write().await?;
        if Self::purge(&mut tx, banner_id).await? == 0 {
            return Err(StorageError::BannerNotFound(banner_id));
        }
        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }

    async fn exists_by_criteria(&self, filter: &BannerFilter) -> Result<bool, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend_err)?;
        let found = Self::matching_banners(&mut conn, filter, Some(1)).await?;
        Ok(!found.is_empty())
    }

    #[instrument(skip(self), fields(filter = %filter))]
    async fn delete_by_criteria(&self, filter: &BannerFilter) -> Result<u64, StorageError> {
        let mut tx = self.begin_write().await?;

        let doomed = Self::matching_banners(&mut tx, filter, None).await?;
        if doomed.is_empty() {
            return Err(StorageError::NotFound);
        }

        let mut deleted = 0;
        for banner_id in doomed {
            deleted += Self::purge(&mut tx, banner_id).await?;
        }

        tx.commit().await.map_err(backend_err)?;
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
