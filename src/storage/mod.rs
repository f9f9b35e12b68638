// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  traits.rs  - BannerStore / CacheStore contracts, errors     │
//! │  memory.rs  - MemoryBannerStore, MemoryCache (in-process)    │
//! │  sql.rs     - SqlBannerStore (SQLite / MySQL via sqlx Any)   │
//! │  redis.rs   - RedisCache (SET .. PX, key prefix)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod traits;
pub mod memory;
pub mod sql;
pub mod redis;
