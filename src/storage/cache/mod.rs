//! Typed facade over the cache store consumed by the serving tier.
//!
//! Keys are slash-joined namespaces; values are scalars, sets or sorted sets
//! of scored members. Backend selection happens in [`open`] by URI scheme.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AppError, Result};

pub mod memory;
pub mod redis;

// Ignored items for each user.
//  ignore_items/{user_id}
pub const IGNORE_ITEMS: &str = "ignore_items";

// Hidden items.
pub const HIDDEN_ITEMS: &str = "hidden_items";

// Sorted set of neighbors for each item.
//  Global item neighbors      - item_neighbors/{item_id}
//  Categorized item neighbors - item_neighbors/{item_id}/{category}
pub const ITEM_NEIGHBORS: &str = "item_neighbors";

// Sorted set of neighbors for each user.
//  User neighbors - user_neighbors/{user_id}
pub const USER_NEIGHBORS: &str = "user_neighbors";

// Collaborative filtering recommendations for each user.
//  Global recommendation      - collaborative_recommend/{user_id}
//  Categorized recommendation - collaborative_recommend/{user_id}/{category}
pub const COLLABORATIVE_RECOMMEND: &str = "collaborative_recommend";

// Offline recommendation for each user.
//  Global recommendation      - offline_recommend/{user_id}
//  Categorized recommendation - offline_recommend/{user_id}/{category}
pub const OFFLINE_RECOMMEND: &str = "offline_recommend";

// Sorted set of popular items.
//  Global popular items      - popular_items
//  Categorized popular items - popular_items/{category}
pub const POPULAR_ITEMS: &str = "popular_items";

// Sorted set of the latest items.
//  Global latest items      - latest_items
//  Categorized latest items - latest_items/{category}
pub const LATEST_ITEMS: &str = "latest_items";

// Item categories.
//  Global item categories - item_categories
//  Categories of an item  - item_categories/{item_id}
pub const ITEM_CATEGORIES: &str = "item_categories";

pub const LAST_MODIFY_ITEM_TIME: &str = "last_modify_item_time";
pub const LAST_MODIFY_USER_TIME: &str = "last_modify_user_time";
pub const LAST_UPDATE_USER_RECOMMEND_TIME: &str = "last_update_user_recommend_time";
pub const LAST_UPDATE_USER_NEIGHBORS_TIME: &str = "last_update_user_neighbors_time";
pub const LAST_UPDATE_ITEM_NEIGHBORS_TIME: &str = "last_update_item_neighbors_time";

// Global meta information.
pub const GLOBAL_META: &str = "global_meta";
pub const DATA_IMPORTED: &str = "data_imported";
pub const NUM_USERS: &str = "num_users";
pub const NUM_ITEMS: &str = "num_items";
pub const NUM_USER_LABELS: &str = "num_user_labels";
pub const NUM_ITEM_LABELS: &str = "num_item_labels";
pub const NUM_TOTAL_POS_FEEDBACKS: &str = "num_total_pos_feedbacks";
pub const NUM_VALID_POS_FEEDBACKS: &str = "num_valid_pos_feedbacks";
pub const NUM_VALID_NEG_FEEDBACKS: &str = "num_valid_neg_feedbacks";
pub const LAST_FIT_MATCHING_MODEL_TIME: &str = "last_fit_matching_model_time";
pub const LAST_FIT_RANKING_MODEL_TIME: &str = "last_fit_ranking_model_time";
pub const LAST_UPDATE_LATEST_ITEMS_TIME: &str = "last_update_latest_items_time";
pub const LAST_UPDATE_POPULAR_ITEMS_TIME: &str = "last_update_popular_items_time";
pub const USER_NEIGHBOR_INDEX_RECALL: &str = "user_neighbor_index_recall";
pub const ITEM_NEIGHBOR_INDEX_RECALL: &str = "item_neighbor_index_recall";
pub const MATCHING_INDEX_RECALL: &str = "matching_index_recall";

/// A member id associated with a score. Ordered high-to-low by score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub id: String,
    pub score: f64,
}

/// Zip ids and scores into a scored list.
///
/// Panics when the lengths differ; mismatched inputs are a programming error.
pub fn create_scored(ids: Vec<String>, scores: Vec<f64>) -> Vec<Scored> {
    if ids.len() != scores.len() {
        panic!("the length of ids and scores must be equal");
    }
    ids.into_iter()
        .zip(scores)
        .map(|(id, score)| Scored { id, score })
        .collect()
}

/// Strip scores, keeping ids in order.
pub fn remove_scores(scored: &[Scored]) -> Vec<String> {
    scored.iter().map(|s| s.id.clone()).collect()
}

/// Strip ids, keeping scores in order.
pub fn get_scores(scored: &[Scored]) -> Vec<f64> {
    scored.iter().map(|s| s.score).collect()
}

/// Sort from high score to low score. Stable.
pub fn sort_scores(scored: &mut [Scored]) {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Compose a cache key. The first part is emitted verbatim; later empty parts
/// are dropped.
pub fn key(parts: &[&str]) -> String {
    let mut composed = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            composed.push_str(part);
        } else if !part.is_empty() {
            composed.push('/');
            composed.push_str(part);
        }
    }
    composed
}

/// Common interface for cache store backends.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn close(&self) -> Result<()>;

    async fn get_string(&self, prefix: &str, name: &str) -> Result<String>;
    async fn set_string(&self, prefix: &str, name: &str, value: &str) -> Result<()>;
    async fn get_int(&self, prefix: &str, name: &str) -> Result<i64>;
    async fn set_int(&self, prefix: &str, name: &str, value: i64) -> Result<()>;
    /// Add 1 to an integer scalar, creating it at 1 when absent.
    async fn incr_int(&self, prefix: &str, name: &str) -> Result<()>;
    async fn get_time(&self, prefix: &str, name: &str) -> Result<DateTime<Utc>>;
    /// Stores UTC whole-second precision; consumers compare by Unix seconds.
    async fn set_time(&self, prefix: &str, name: &str, value: DateTime<Utc>) -> Result<()>;
    async fn delete(&self, prefix: &str, name: &str) -> Result<()>;
    /// 1 for each name that exists, 0 otherwise, in input order.
    async fn exists(&self, prefix: &str, names: &[&str]) -> Result<Vec<i32>>;

    /// Members sorted ascending; missing keys yield an empty list.
    async fn get_set(&self, key: &str) -> Result<Vec<String>>;
    /// Replace the whole set; no members clears it.
    async fn set_set(&self, key: &str, members: &[&str]) -> Result<()>;
    async fn add_set(&self, key: &str, members: &[&str]) -> Result<()>;
    async fn rem_set(&self, key: &str, members: &[&str]) -> Result<()>;

    /// Inclusive index range, descending by score; `end = -1` means "to end".
    async fn get_sorted(&self, key: &str, begin: isize, end: isize) -> Result<Vec<Scored>>;
    /// Inclusive score range, ascending by score.
    async fn get_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<Vec<Scored>>;
    async fn get_sorted_score(&self, key: &str, member: &str) -> Result<f64>;
    /// Upsert each member with its score.
    async fn add_sorted(&self, key: &str, scored: &[Scored]) -> Result<()>;
    /// Replace the whole sorted set.
    async fn set_sorted(&self, key: &str, scored: &[Scored]) -> Result<()>;
    /// Add 1.0 to a member's score, creating it at 1.0 when absent.
    async fn incr_sorted(&self, key: &str, member: &str) -> Result<()>;
    async fn rem_sorted(&self, key: &str, member: &str) -> Result<()>;
    async fn rem_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<()>;
}

const REDIS_PREFIX: &str = "redis://";
const MEMORY_PREFIX: &str = "memory://";

/// Open a cache store, dispatching on the URI scheme.
pub fn open(path: &str) -> Result<Arc<dyn CacheStore>> {
    if path.starts_with(REDIS_PREFIX) {
        Ok(Arc::new(redis::RedisCache::open(path)?))
    } else if path.starts_with(MEMORY_PREFIX) {
        Ok(Arc::new(memory::MemoryCache::new()))
    } else {
        Err(AppError::Configuration(format!(
            "unknown cache store: {}",
            path
        )))
    }
}

#[cfg(test)]
pub(crate) mod test_suite {
    //! Backend-independent cache store conformance checks.

    use super::*;
    use chrono::TimeZone;

    pub async fn test_meta(store: &dyn CacheStore) {
        store.set_string("meta", "1", "2").await.unwrap();
        assert_eq!(store.get_string("meta", "1").await.unwrap(), "2");
        store.delete("meta", "1").await.unwrap();
        let err = store.get_string("meta", "1").await.unwrap_err();
        assert!(err.is_not_found());

        store.set_int("meta", "1", 2).await.unwrap();
        assert_eq!(store.get_int("meta", "1").await.unwrap(), 2);
        store.incr_int("meta", "1").await.unwrap();
        assert_eq!(store.get_int("meta", "1").await.unwrap(), 3);

        let date = Utc.with_ymd_and_hms(1996, 4, 8, 0, 0, 0).unwrap();
        store.set_time("meta", "1", date).await.unwrap();
        let read = store.get_time("meta", "1").await.unwrap();
        assert_eq!(read, date);

        assert_eq!(
            store.exists("meta", &["1", "10000"]).await.unwrap(),
            vec![1, 0]
        );
    }

    pub async fn test_set(store: &dyn CacheStore) {
        store.set_set("set", &["1"]).await.unwrap();
        store.add_set("set", &["2"]).await.unwrap();
        assert_eq!(
            store.get_set("set").await.unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );
        store.rem_set("set", &["1"]).await.unwrap();
        assert_eq!(store.get_set("set").await.unwrap(), vec!["2".to_string()]);
        store.set_set("set", &["3"]).await.unwrap();
        assert_eq!(store.get_set("set").await.unwrap(), vec!["3".to_string()]);

        store.add_set("set", &[]).await.unwrap();
        store.set_set("set", &[]).await.unwrap();
        assert!(store.get_set("set").await.unwrap().is_empty());
        assert!(store.get_set("unknown_set").await.unwrap().is_empty());
    }

    pub async fn test_sort(store: &dyn CacheStore) {
        let scores = vec![
            Scored { id: "0".into(), score: 0.0 },
            Scored { id: "1".into(), score: 1.1 },
            Scored { id: "2".into(), score: 1.2 },
            Scored { id: "3".into(), score: 1.3 },
            Scored { id: "4".into(), score: 1.4 },
        ];
        store.set_sorted("sort", &scores[..3]).await.unwrap();
        store.add_sorted("sort", &scores[3..]).await.unwrap();
        let total = store.get_sorted("sort", 0, -1).await.unwrap();
        assert_eq!(
            total,
            vec![
                Scored { id: "4".into(), score: 1.4 },
                Scored { id: "3".into(), score: 1.3 },
                Scored { id: "2".into(), score: 1.2 },
                Scored { id: "1".into(), score: 1.1 },
                Scored { id: "0".into(), score: 0.0 },
            ]
        );
        let part = store.get_sorted_by_score("sort", 1.1, 1.3).await.unwrap();
        assert_eq!(
            part,
            vec![
                Scored { id: "1".into(), score: 1.1 },
                Scored { id: "2".into(), score: 1.2 },
                Scored { id: "3".into(), score: 1.3 },
            ]
        );

        store
            .add_sorted(
                "sort",
                &[
                    Scored { id: "5".into(), score: -5.0 },
                    Scored { id: "6".into(), score: -6.0 },
                ],
            )
            .await
            .unwrap();
        store
            .rem_sorted_by_score("sort", f64::NEG_INFINITY, -1.0)
            .await
            .unwrap();
        assert!(store
            .get_sorted_by_score("sort", f64::NEG_INFINITY, -1.0)
            .await
            .unwrap()
            .is_empty());

        store.incr_sorted("sort", "0").await.unwrap();
        store.incr_sorted("sort", "0").await.unwrap();
        let total = store.get_sorted("sort", 0, -1).await.unwrap();
        assert_eq!(
            total,
            vec![
                Scored { id: "0".into(), score: 2.0 },
                Scored { id: "4".into(), score: 1.4 },
                Scored { id: "3".into(), score: 1.3 },
                Scored { id: "2".into(), score: 1.2 },
                Scored { id: "1".into(), score: 1.1 },
            ]
        );

        store.rem_sorted("sort", "0").await.unwrap();
        let total = store.get_sorted("sort", 0, -1).await.unwrap();
        assert_eq!(total.len(), 4);
        assert_eq!(total[0], Scored { id: "4".into(), score: 1.4 });

        assert_eq!(store.get_sorted_score("sort", "2").await.unwrap(), 1.2);

        store.set_sorted("sort", &[]).await.unwrap();
        assert!(store.get_sorted("sort", 0, -1).await.unwrap().is_empty());
        let err = store.get_sorted_score("sort", "10086").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
