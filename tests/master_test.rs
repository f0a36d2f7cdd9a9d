//! End-to-end pipeline run on in-memory backends: dataset load, neighbor
//! sweeps, model fits, freshness transitions and click-through rate analysis.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use offline_master::config::Config;
use offline_master::dataset::{ClickDataset, RankingDataset};
use offline_master::jobs::monitor::{TaskRunner, TaskTracker};
use offline_master::jobs::{CycleState, Master};
use offline_master::model::{
    ClickModel, ClickModelSearcher, ClickScore, FitConfig, LocalCache, ModelParams, RankingModel,
    RankingModelSearcher, RankingScore,
};
use offline_master::storage::cache::{
    self, key, CacheStore, GLOBAL_META, ITEM_NEIGHBORS, LAST_MODIFY_ITEM_TIME,
    LAST_UPDATE_ITEM_NEIGHBORS_TIME, LATEST_ITEMS, NUM_USERS, POPULAR_ITEMS, USER_NEIGHBORS,
};
use offline_master::storage::data::memory::MemoryDataStore;
use offline_master::storage::data::{DataStore, Feedback, Item, User};
use offline_master::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StubRankingModel {
    fitted: bool,
}

impl RankingModel for StubRankingModel {
    fn fit(
        &mut self,
        _train: &RankingDataset,
        _test: &RankingDataset,
        _config: &FitConfig,
    ) -> RankingScore {
        self.fitted = true;
        RankingScore {
            ndcg: 0.4,
            precision: 0.2,
            recall: 0.3,
        }
    }

    fn params(&self) -> ModelParams {
        ModelParams(BTreeMap::from([("lr".to_string(), "0.05".to_string())]))
    }

    fn invalid(&self) -> bool {
        !self.fitted
    }

    fn clone_model(&self) -> Box<dyn RankingModel> {
        Box::new(self.clone())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).expect("serialize stub model"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StubClickModel {
    fitted: bool,
}

impl ClickModel for StubClickModel {
    fn fit(
        &mut self,
        _train: &ClickDataset,
        _test: &ClickDataset,
        _config: &FitConfig,
    ) -> ClickScore {
        self.fitted = true;
        ClickScore {
            precision: 0.6,
            recall: 0.4,
            auc: 0.7,
        }
    }

    fn params(&self) -> ModelParams {
        ModelParams(BTreeMap::from([("n_epochs".to_string(), "20".to_string())]))
    }

    fn invalid(&self) -> bool {
        !self.fitted
    }

    fn clone_model(&self) -> Box<dyn ClickModel> {
        Box::new(self.clone())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).expect("serialize stub model"))
    }
}

struct IdleRankingSearcher;

#[async_trait]
impl RankingModelSearcher for IdleRankingSearcher {
    async fn fit(
        &self,
        _train: Arc<RankingDataset>,
        _test: Arc<RankingDataset>,
        tracker: TaskTracker,
        _runner: TaskRunner,
    ) -> Result<()> {
        tracker.start(1);
        tracker.finish();
        Ok(())
    }

    fn best_model(&self) -> Option<(String, Box<dyn RankingModel>, RankingScore)> {
        None
    }
}

struct IdleClickSearcher;

#[async_trait]
impl ClickModelSearcher for IdleClickSearcher {
    async fn fit(
        &self,
        _train: Arc<ClickDataset>,
        _test: Arc<ClickDataset>,
        tracker: TaskTracker,
        _runner: TaskRunner,
    ) -> Result<()> {
        tracker.start(1);
        tracker.finish();
        Ok(())
    }

    fn best_model(&self) -> Option<(Box<dyn ClickModel>, ClickScore)> {
        None
    }
}

fn seeded_store() -> Arc<MemoryDataStore> {
    let store = MemoryDataStore::new();
    let now = Utc::now();
    for (user_id, labels) in [
        ("alice", vec!["rust", "db"]),
        ("bob", vec!["db", "web"]),
        ("carol", vec!["rust"]),
    ] {
        store.insert_user(User {
            user_id: user_id.to_string(),
            labels: labels.into_iter().map(str::to_string).collect(),
        });
    }
    let items: [(&str, Vec<&str>, Vec<&str>, bool); 4] = [
        ("post1", vec!["tech"], vec!["rust", "db"], false),
        ("post2", vec!["life"], vec!["db", "web"], false),
        ("post3", vec!["tech", "life"], vec!["rust", "web"], false),
        ("banned", vec!["tech"], vec!["rust", "db"], true),
    ];
    for (index, (item_id, categories, labels, is_hidden)) in items.into_iter().enumerate() {
        store.insert_item(Item {
            item_id: item_id.to_string(),
            is_hidden,
            categories: categories.into_iter().map(str::to_string).collect(),
            timestamp: Some(now - Duration::hours(24 * (index as i64 + 1))),
            labels: labels.into_iter().map(str::to_string).collect(),
        });
    }
    for (user_id, item_id) in [
        ("alice", "post1"),
        ("alice", "post2"),
        ("bob", "post2"),
        ("bob", "post3"),
        ("carol", "post1"),
        ("carol", "post3"),
    ] {
        store.insert_feedback(Feedback {
            feedback_type: "star".to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            timestamp: now - Duration::hours(10),
        });
    }
    for (user_id, item_id) in [("alice", "post3"), ("bob", "post1"), ("carol", "post2")] {
        store.insert_feedback(Feedback {
            feedback_type: "read".to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
            timestamp: now - Duration::hours(8),
        });
    }
    Arc::new(store)
}

fn build_master(store: Arc<MemoryDataStore>) -> Master {
    let cache_store = cache::open("memory://").unwrap();
    let mut config = Config::default();
    config.database.positive_feedback_types = vec!["star".to_string()];
    config.database.read_feedback_types = vec!["read".to_string()];
    config.master.num_jobs = 2;
    let dir = tempfile::tempdir().unwrap().into_path();
    Master::new(
        config,
        store,
        cache_store,
        Box::new(StubRankingModel { fitted: false }),
        "bpr",
        Box::new(StubClickModel { fitted: false }),
        Arc::new(IdleRankingSearcher),
        Arc::new(IdleClickSearcher),
        dir.join("master_cache"),
    )
}

#[tokio::test]
async fn test_full_cycle_produces_all_artifacts() {
    let master = build_master(seeded_store());
    let mut state = CycleState::default();
    master.run_cycle(&mut state).await;

    let cache = master.cache_store();

    // Popularity and recency lists, globally and per category.
    for list in [POPULAR_ITEMS, LATEST_ITEMS] {
        let global = cache.get_sorted(list, 0, -1).await.unwrap();
        assert!(!global.is_empty(), "{} is empty", list);
        assert!(global.iter().all(|s| s.id != "banned"));
        let tech = cache.get_sorted(&key(&[list, "tech"]), 0, -1).await.unwrap();
        assert!(!tech.is_empty());
    }

    // Neighbor lists for items and users.
    let neighbors = cache
        .get_sorted(&key(&[ITEM_NEIGHBORS, "post1"]), 0, -1)
        .await
        .unwrap();
    assert!(!neighbors.is_empty());
    assert!(neighbors.iter().all(|s| s.id != "post1" && s.id != "banned"));
    let neighbors = cache
        .get_sorted(&key(&[USER_NEIGHBORS, "alice"]), 0, -1)
        .await
        .unwrap();
    assert!(!neighbors.is_empty());

    // Statistics and sweep markers.
    assert_eq!(cache.get_int(GLOBAL_META, NUM_USERS).await.unwrap(), 3);
    assert!(cache
        .get_time(GLOBAL_META, LAST_UPDATE_ITEM_NEIGHBORS_TIME)
        .await
        .is_ok());

    // Both models were fitted and persisted together.
    let path = master.local_cache_path();
    let loaded = LocalCache::load(&path).unwrap();
    assert_eq!(loaded.ranking_model_name, "bpr");
    assert_eq!(loaded.ranking_model_version, 1);
    assert_eq!(loaded.click_model_version, 1);
    assert!(loaded.ranking_model.is_some());
    assert!(loaded.click_model.is_some());

    // Change deltas were recorded for the next cycle.
    assert_eq!(state.ranking.users, 3);
    assert_eq!(state.ranking.items, 4);
    assert!(state.click.feedback > 0);
}

#[tokio::test]
async fn test_freshness_gate_across_sweeps() {
    let master = build_master(seeded_store());
    let mut state = CycleState::default();
    master.run_cycle(&mut state).await;

    let cache = master.cache_store();
    let t0 = Utc::now() - Duration::seconds(2000);
    let t1 = Utc::now() - Duration::seconds(1000);

    // Mark post1 modified after its last neighbor update: stale.
    cache
        .set_time(LAST_UPDATE_ITEM_NEIGHBORS_TIME, "post1", t0)
        .await
        .unwrap();
    cache
        .set_time(LAST_MODIFY_ITEM_TIME, "post1", t1)
        .await
        .unwrap();
    assert!(master.is_item_neighbors_stale("post1", &[]).await);

    // A new sweep recomputes post1 and writes an update time past t1.
    let train = master.ranking_train_set().await;
    master.run_find_item_neighbors_task(&train).await;
    let updated = cache
        .get_time(LAST_UPDATE_ITEM_NEIGHBORS_TIME, "post1")
        .await
        .unwrap();
    assert!(updated.timestamp() > t1.timestamp());
    assert!(!master.is_item_neighbors_stale("post1", &[]).await);
}

#[tokio::test]
async fn test_analyze_task_records_thirty_days() {
    let store = seeded_store();
    let master = build_master(store.clone());
    master.run_analyze_task().await.unwrap();

    let name = key(&["PositiveFeedbackRate", "star"]);
    let measurements = store.measurements(&name, 60).await.unwrap();
    assert_eq!(measurements.len(), 30);
    // Running again inserts nothing new.
    master.run_analyze_task().await.unwrap();
    let measurements = store.measurements(&name, 60).await.unwrap();
    assert_eq!(measurements.len(), 30);
}
