// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests for banner engine invariants.
//!
//! Random create / rotate / choose / delete sequences over a deliberately
//! tiny tag and feature space, so collisions are common. Sequences run
//! against the in-memory store and against SQLite. After every step:
//! - no (tag, feature) pair is claimed by two banners
//! - a failed operation left the observable state unchanged
//! - failures are conflicts, misses or bad input, never backend errors
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

use banner_engine::banner::MAX_PAGE_OFFSET;
use banner_engine::{
    cache_key, BannerEngine, BannerEngineConfig, BannerFilter, BannerId, BannerPatch,
    BannerSummary, EngineError, ErrorKind, FeatureId, MemoryBannerStore, MemoryCache, NewBanner,
    Page, TagId, VersionId,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Create {
        tags: Vec<TagId>,
        feature: FeatureId,
        active: bool,
    },
    Rotate {
        pick: usize,
        tags: Option<Vec<TagId>>,
        feature: Option<FeatureId>,
        active: Option<bool>,
    },
    Choose {
        pick: usize,
        version_pick: usize,
    },
    Delete {
        pick: usize,
    },
}

fn tags_strategy() -> impl Strategy<Value = Vec<TagId>> {
    prop::collection::vec(1i64..6, 1..4)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (tags_strategy(), 1i64..4, any::<bool>())
            .prop_map(|(tags, feature, active)| Op::Create { tags, feature, active }),
        3 => (
            any::<usize>(),
            prop::option::of(tags_strategy()),
            prop::option::of(1i64..4),
            prop::option::of(any::<bool>()),
        )
            .prop_map(|(pick, tags, feature, active)| Op::Rotate { pick, tags, feature, active }),
        2 => (any::<usize>(), any::<usize>())
            .prop_map(|(pick, version_pick)| Op::Choose { pick, version_pick }),
        1 => any::<usize>().prop_map(|pick| Op::Delete { pick }),
    ]
}

/// Generate arbitrary JSON values
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::hash_map("[a-z_]{1,8}", inner, 0..6)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn all() -> Page {
    Page::new(100, 0).unwrap()
}

#[derive(Debug, PartialEq)]
struct Snapshot {
    chosen: Vec<BannerSummary>,
    /// Version ids per known banner, `None` once deleted
    histories: Vec<Option<Vec<VersionId>>>,
}

async fn snapshot(engine: &BannerEngine, banners: &[BannerId]) -> Snapshot {
    let mut chosen = engine
        .list_active(BannerFilter::default(), all())
        .await
        .unwrap();
    chosen.sort_by_key(|s| s.banner_id);

    let mut histories = Vec::with_capacity(banners.len());
    for id in banners {
        let history = engine.list_versions(*id, all()).await.ok();
        histories.push(history.map(|h| h.iter().map(|v| v.version_id).collect()));
    }
    Snapshot { chosen, histories }
}

fn check_unique(
    chosen: &[BannerSummary],
    memory: Option<&MemoryBannerStore>,
) -> Result<(), TestCaseError> {
    let mut claims: HashMap<(TagId, FeatureId), BannerId> = HashMap::new();
    for summary in chosen {
        for tag in &summary.tag_ids {
            if let Some(other) = claims.insert((*tag, summary.feature_id), summary.banner_id) {
                prop_assert!(
                    other == summary.banner_id,
                    "banners {} and {} both claim tag {} feature {}",
                    other,
                    summary.banner_id,
                    tag,
                    summary.feature_id
                );
            }
        }
    }

    if let Some(store) = memory {
        let mut derived: Vec<_> = claims.into_iter().collect();
        derived.sort_unstable();
        let mut indexed = store.chosen_index();
        indexed.sort_unstable();
        prop_assert_eq!(derived, indexed);
    }
    Ok(())
}

fn pick<T: Copy>(items: &[T], at: usize) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        Some(items[at % items.len()])
    }
}

async fn apply(
    engine: &BannerEngine,
    op: Op,
    banners: &mut Vec<BannerId>,
    versions: &mut Vec<VersionId>,
) -> Option<Result<(), EngineError>> {
    let result = match op {
        Op::Create { tags, feature, active } => {
            let created = engine
                .create_banner(NewBanner::new(tags, feature, json!({"f": feature}), active))
                .await;
            if let Ok(id) = created {
                banners.push(id);
                let first = engine.list_versions(id, all()).await.ok()?;
                versions.push(first.first()?.version_id);
            }
            created.map(|_| ())
        }
        Op::Rotate { pick: at, tags, feature, active } => {
            let id = pick(banners, at)?;
            let patch = BannerPatch {
                tag_ids: tags,
                feature_id: feature,
                content: None,
                is_active: active,
            };
            let rotated = engine.rotate_version(id, patch).await;
            if let Ok(version_id) = rotated {
                versions.push(version_id);
            }
            rotated.map(|_| ())
        }
        Op::Choose { pick: at, version_pick } => {
            let id = pick(banners, at)?;
            let version_id = pick(versions, version_pick)?;
            engine.choose_version(id, version_id).await
        }
        Op::Delete { pick: at } => {
            let id = pick(banners, at)?;
            engine.delete_banner(id).await
        }
    };
    Some(result)
}

async fn run_ops_on(
    engine: &BannerEngine,
    memory: Option<&MemoryBannerStore>,
    ops: Vec<Op>,
) -> Result<(), TestCaseError> {
    let mut banners = Vec::new();
    let mut versions = Vec::new();

    for op in ops {
        let before = snapshot(engine, &banners).await;
        let Some(result) = apply(engine, op.clone(), &mut banners, &mut versions).await else {
            continue;
        };

        let after = snapshot(engine, &banners).await;
        if let Err(e) = result {
            prop_assert!(
                matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::Invalid),
                "unexpected error kind for {:?}: {}",
                op,
                e
            );
            prop_assert_eq!(&after, &before, "failed {:?} changed state", op);
        }
        check_unique(&after.chosen, memory)?;
    }
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn run_ops(ops: Vec<Op>) -> Result<(), TestCaseError> {
    runtime().block_on(async move {
        let store = Arc::new(MemoryBannerStore::new());
        let engine = BannerEngine::with_backends(
            BannerEngineConfig::default(),
            store.clone(),
            Arc::new(MemoryCache::new()),
        );
        run_ops_on(&engine, Some(&store), ops).await
    })
}

fn run_ops_sqlite(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let dir = TempDir::new().unwrap();
    let config = BannerEngineConfig {
        sql_url: Some(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("fuzz.db").display()
        )),
        ..Default::default()
    };

    runtime().block_on(async move {
        let engine = BannerEngine::connect(config).await.unwrap();
        run_ops_on(&engine, None, ops).await
    })
}

// =============================================================================
// Uniqueness invariant
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// No sequence of writes lets two banners claim the same (tag, feature)
    #[test]
    fn prop_chosen_index_stays_unique(ops in prop::collection::vec(op_strategy(), 1..40)) {
        run_ops(ops)?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Same invariant with the database unique constraint doing the work
    #[test]
    fn prop_sqlite_chosen_index_stays_unique(ops in prop::collection::vec(op_strategy(), 1..25)) {
        run_ops_sqlite(ops)?;
    }
}

// =============================================================================
// Input handling
// =============================================================================

proptest! {
    /// Patch deserialization never panics on arbitrary JSON
    #[test]
    fn fuzz_patch_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let _ = serde_json::from_slice::<BannerPatch>(&serialized);
        let _ = serde_json::from_slice::<NewBanner>(&serialized);
    }

    /// Overlay keeps every field the patch leaves out
    #[test]
    fn prop_overlay_carries_unset_fields(
        tags in tags_strategy(),
        feature in 1i64..100,
        active in any::<bool>(),
        content in arbitrary_json_strategy(),
    ) {
        let base = NewBanner::new(tags.clone(), feature, json!({"base": true}), active);
        let merged = base.overlay(&BannerPatch::default().with_content(content.clone()));
        prop_assert_eq!(merged.tag_ids, tags);
        prop_assert_eq!(merged.feature_id, feature);
        prop_assert_eq!(merged.is_active, active);
        prop_assert_eq!(merged.content, content);
    }

    /// Limits outside 1..=100 and offsets past i64::MAX are rejected
    #[test]
    fn prop_page_bounds(limit in 0u32..500, offset in any::<u64>()) {
        let page = Page::new(limit, offset);
        prop_assert_eq!(
            page.is_ok(),
            (1..=100).contains(&limit) && offset <= MAX_PAGE_OFFSET
        );
        if let Ok(page) = page {
            prop_assert!(page.sql_offset().unwrap() >= 0);
        }
    }

    /// Distinct (tag, feature, privilege) triples never share a cache key
    #[test]
    fn prop_cache_keys_distinct(
        triples in prop::collection::hash_set((any::<i64>(), any::<i64>(), any::<bool>()), 1..50)
    ) {
        let keys: HashSet<String> = triples
            .iter()
            .map(|(t, f, p)| cache_key(*t, *f, *p))
            .collect();
        prop_assert_eq!(keys.len(), triples.len());
    }
}
