//! Dataset assembly from the streaming data store.
//!
//! Five monitored steps: users, items, positive feedback, read feedback, and
//! the click dataset build. Alongside the two datasets the load produces the
//! per-category recency and popularity lists.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{DatasetSplit, Master, BATCH_SIZE};
use crate::dataset::{ClickDataset, MapIndex, RankingDataset, NOT_ID};
use crate::error::{AppError, Result};
use crate::heap::TopKStringFilter;
use crate::metrics;
use crate::jobs::monitor::TASK_LOAD_DATASET;
use crate::storage::cache::{
    create_scored, key, CacheStore, Scored, GLOBAL_META, ITEM_CATEGORIES,
    LAST_UPDATE_LATEST_ITEMS_TIME, LAST_UPDATE_POPULAR_ITEMS_TIME, LATEST_ITEMS, NUM_ITEMS,
    NUM_ITEM_LABELS, NUM_TOTAL_POS_FEEDBACKS, NUM_USERS, NUM_USER_LABELS,
    NUM_VALID_NEG_FEEDBACKS, NUM_VALID_POS_FEEDBACKS, POPULAR_ITEMS,
};
use crate::storage::data::DataStore;

pub struct LoadedData {
    pub ranking: RankingDataset,
    pub click: ClickDataset,
    pub latest_items: HashMap<String, Vec<Scored>>,
    pub popular_items: HashMap<String, Vec<Scored>>,
}

fn step_error(step: &str, err: AppError) -> AppError {
    AppError::DataStore(format!("{}: {}", step, err))
}

impl Master {
    /// Load both datasets, refresh the cached popularity/recency lists and
    /// statistics, and swap the train/test splits.
    pub async fn run_load_dataset_task(&self) -> Result<()> {
        info!(
            positive_feedback_types = ?self.config.database.positive_feedback_types,
            read_feedback_types = ?self.config.database.read_feedback_types,
            item_ttl = self.config.database.item_ttl,
            feedback_ttl = self.config.database.positive_feedback_ttl,
            "load dataset"
        );
        let LoadedData {
            ranking,
            click,
            latest_items,
            popular_items,
        } = self.load_data_from_database().await?;

        // Save popular items, reclaiming entries that fell below the head.
        for (category, items) in &popular_items {
            let sorted_key = key(&[POPULAR_ITEMS, category]);
            if let Err(err) = self.cache_store.add_sorted(&sorted_key, items).await {
                error!(error = %err, "failed to cache popular items");
            }
            if let Some(last) = items.last() {
                let threshold = last.score - 1.0;
                if let Err(err) = self
                    .cache_store
                    .rem_sorted_by_score(&sorted_key, f64::NEG_INFINITY, threshold)
                    .await
                {
                    error!(error = %err, "failed to reclaim unpopular items");
                }
            }
        }
        if let Err(err) = self
            .cache_store
            .set_time(GLOBAL_META, LAST_UPDATE_POPULAR_ITEMS_TIME, Utc::now())
            .await
        {
            error!(error = %err, "failed to write popular items update time");
        }

        // Save the latest items, reclaiming outdated entries.
        for (category, items) in &latest_items {
            let sorted_key = key(&[LATEST_ITEMS, category]);
            if let Err(err) = self.cache_store.add_sorted(&sorted_key, items).await {
                error!(error = %err, "failed to cache latest items");
            }
            if let Some(last) = items.last() {
                let threshold = last.score - 1.0;
                if let Err(err) = self
                    .cache_store
                    .rem_sorted_by_score(&sorted_key, f64::NEG_INFINITY, threshold)
                    .await
                {
                    error!(error = %err, "failed to reclaim outdated items");
                }
            }
        }
        if let Err(err) = self
            .cache_store
            .set_time(GLOBAL_META, LAST_UPDATE_LATEST_ITEMS_TIME, Utc::now())
            .await
        {
            error!(error = %err, "failed to write latest items update time");
        }

        // Write statistics to the cache and the metric gauges. These writes
        // are ancillary: failures are logged and swallowed.
        let stats: [(&str, i64); 7] = [
            (NUM_USERS, ranking.user_count() as i64),
            (NUM_ITEMS, ranking.item_count() as i64),
            (NUM_TOTAL_POS_FEEDBACKS, ranking.count() as i64),
            (NUM_USER_LABELS, click.num_user_labels as i64),
            (NUM_ITEM_LABELS, click.num_item_labels as i64),
            (NUM_VALID_POS_FEEDBACKS, click.positive_count as i64),
            (NUM_VALID_NEG_FEEDBACKS, click.negative_count as i64),
        ];
        for (name, value) in stats {
            if let Err(err) = self.cache_store.set_int(GLOBAL_META, name, value).await {
                error!(error = %err, name, "failed to write statistics");
            }
        }
        metrics::USERS_TOTAL.set(ranking.user_count() as i64);
        metrics::ITEMS_TOTAL.set(ranking.item_count() as i64);
        metrics::FEEDBACKS_TOTAL.set(ranking.count() as i64);
        metrics::USER_LABELS_TOTAL.set(click.num_user_labels as i64);
        metrics::ITEM_LABELS_TOTAL.set(click.num_item_labels as i64);
        metrics::POSITIVE_FEEDBACKS_TOTAL.set(click.positive_count as i64);
        metrics::NEGATIVE_FEEDBACKS_TOTAL.set(click.negative_count as i64);

        // Write categories to the cache.
        let categories: Vec<&str> = ranking.category_set.iter().map(String::as_str).collect();
        if let Err(err) = self.cache_store.set_set(ITEM_CATEGORIES, &categories).await {
            error!(error = %err, "failed to write categories");
        }
        for (index, item_categories) in ranking.item_categories.iter().enumerate() {
            let item_id = ranking.item_index.to_name(index as i32);
            let members: Vec<&str> = item_categories.iter().map(String::as_str).collect();
            if let Err(err) = self
                .cache_store
                .set_set(&key(&[ITEM_CATEGORIES, item_id]), &members)
                .await
            {
                error!(error = %err, item_id, "failed to write item categories");
            }
        }

        // Split the ranking dataset: full train, empty test.
        {
            let mut guard = self.ranking_data.write().await;
            let (train, test) = ranking.split(0.0, 0);
            *guard = DatasetSplit { train, test };
        }
        // Split the click dataset.
        {
            let mut guard = self.click_data.write().await;
            let (train, test) = click.split(0.2, 0);
            *guard = DatasetSplit { train, test };
        }
        Ok(())
    }

    /// Pull users, items, positive and read feedback from the data store and
    /// assemble the ranking dataset, the click dataset, and the per-category
    /// recency and popularity lists.
    pub async fn load_data_from_database(&self) -> Result<LoadedData> {
        self.task_monitor.start(TASK_LOAD_DATASET, 5);

        let now = Utc::now();
        let item_time_limit = match self.config.database.item_ttl {
            0 => None,
            days => Some(now - chrono::Duration::days(days as i64)),
        };
        let feedback_time_limit = match self.config.database.positive_feedback_ttl {
            0 => None,
            days => Some(now - chrono::Duration::days(days as i64)),
        };
        let popular_window_limit = match self.config.recommend.popular_window {
            0 => DateTime::<Utc>::MIN_UTC,
            days => now - chrono::Duration::days(days as i64),
        };
        let cache_size = self.config.database.cache_size;

        let mut ranking = RankingDataset::new();
        let mut latest_filters: HashMap<String, TopKStringFilter> = HashMap::new();
        latest_filters.insert(String::new(), TopKStringFilter::new(cache_size));

        // STEP 1: pull users.
        let mut user_label_index = MapIndex::new();
        let start = Instant::now();
        let mut stream = self.data_store.user_stream(BATCH_SIZE);
        while let Some(users) = stream.batches.recv().await {
            for user in users {
                let user_index = ranking.add_user(&user.user_id) as usize;
                ranking.user_labels[user_index] = user
                    .labels
                    .iter()
                    .map(|label| user_label_index.add(label))
                    .collect();
            }
        }
        stream
            .terminal()
            .await
            .map_err(|err| step_error("pull users", err))?;
        ranking.num_user_labels = user_label_index.len();
        self.task_monitor.update(TASK_LOAD_DATASET, 1);
        debug!(
            n_users = ranking.user_count(),
            n_user_labels = user_label_index.len(),
            used_time = ?start.elapsed(),
            "pulled users from database"
        );

        // STEP 2: pull items.
        let mut item_label_index = MapIndex::new();
        let start = Instant::now();
        let mut stream = self.data_store.item_stream(BATCH_SIZE, item_time_limit);
        while let Some(items) = stream.batches.recv().await {
            for item in items {
                let item_index = ranking.add_item(&item.item_id) as usize;
                ranking.item_labels[item_index] = item
                    .labels
                    .iter()
                    .map(|label| item_label_index.add(label))
                    .collect();
                ranking.item_categories[item_index] = item.categories.clone();
                ranking
                    .category_set
                    .extend(item.categories.iter().cloned());
                if item.is_hidden {
                    ranking.hidden_items[item_index] = true;
                } else if let Some(timestamp) = item.timestamp {
                    // Feed the recency filter, globally and per category.
                    let score = timestamp.timestamp() as f64;
                    if let Some(filter) = latest_filters.get_mut("") {
                        filter.push(item.item_id.clone(), score);
                    }
                    for category in &item.categories {
                        latest_filters
                            .entry(category.clone())
                            .or_insert_with(|| TopKStringFilter::new(cache_size))
                            .push(item.item_id.clone(), score);
                    }
                }
            }
        }
        stream
            .terminal()
            .await
            .map_err(|err| step_error("pull items", err))?;
        ranking.num_item_labels = item_label_index.len();
        self.task_monitor.update(TASK_LOAD_DATASET, 2);
        debug!(
            n_items = ranking.item_count(),
            n_item_labels = item_label_index.len(),
            used_time = ?start.elapsed(),
            "pulled items from database"
        );

        // STEP 3: pull positive feedback.
        let mut popular_count = vec![0i64; ranking.item_count()];
        let mut positive_sets: Vec<HashSet<i32>> = vec![HashSet::new(); ranking.user_count()];
        let start = Instant::now();
        let mut stream = self.data_store.feedback_stream(
            BATCH_SIZE,
            feedback_time_limit,
            &self.config.database.positive_feedback_types,
        );
        while let Some(batch) = stream.batches.recv().await {
            for feedback in batch {
                ranking.add_feedback(&feedback.user_id, &feedback.item_id, false);
                let user_index = ranking.user_index.to_number(&feedback.user_id);
                if user_index == NOT_ID {
                    continue;
                }
                let item_index = ranking.item_index.to_number(&feedback.item_id);
                if item_index == NOT_ID {
                    continue;
                }
                positive_sets[user_index as usize].insert(item_index);
                if feedback.timestamp > popular_window_limit
                    && !ranking.hidden_items[item_index as usize]
                {
                    popular_count[item_index as usize] += 1;
                }
            }
        }
        stream
            .terminal()
            .await
            .map_err(|err| step_error("pull positive feedback", err))?;
        self.task_monitor.update(TASK_LOAD_DATASET, 3);
        debug!(
            n_positive_feedback = ranking.count(),
            used_time = ?start.elapsed(),
            "pulled positive feedback from database"
        );

        // STEP 4: pull read feedback; exposures without preference become
        // negative candidates.
        let mut negative_sets: Vec<HashSet<i32>> = vec![HashSet::new(); ranking.user_count()];
        let start = Instant::now();
        let mut stream = self.data_store.feedback_stream(
            BATCH_SIZE,
            feedback_time_limit,
            &self.config.database.read_feedback_types,
        );
        while let Some(batch) = stream.batches.recv().await {
            for feedback in batch {
                let user_index = ranking.user_index.to_number(&feedback.user_id);
                if user_index == NOT_ID {
                    continue;
                }
                let item_index = ranking.item_index.to_number(&feedback.item_id);
                if item_index == NOT_ID {
                    continue;
                }
                if !positive_sets[user_index as usize].contains(&item_index) {
                    negative_sets[user_index as usize].insert(item_index);
                }
            }
        }
        stream
            .terminal()
            .await
            .map_err(|err| step_error("pull read feedback", err))?;
        self.task_monitor.update(TASK_LOAD_DATASET, 4);

        // Label and feedback lists are sorted ascending from here on.
        ranking.sort_lists();

        // STEP 5: create the click dataset. Users lacking either polarity are
        // skipped and their sets released immediately to bound peak memory.
        let mut click = ClickDataset {
            user_features: Arc::new(ranking.user_labels.clone()),
            item_features: Arc::new(ranking.item_labels.clone()),
            num_users: ranking.user_count(),
            num_items: ranking.item_count(),
            num_user_labels: ranking.num_user_labels,
            num_item_labels: ranking.num_item_labels,
            ..Default::default()
        };
        for user_index in 0..positive_sets.len() {
            if positive_sets[user_index].is_empty() || negative_sets[user_index].is_empty() {
                positive_sets[user_index] = HashSet::new();
                negative_sets[user_index] = HashSet::new();
                continue;
            }
            let mut positives: Vec<i32> =
                mem::take(&mut positive_sets[user_index]).into_iter().collect();
            positives.sort_unstable();
            for item_index in positives {
                click.push_row(user_index as i32, item_index, 1);
            }
            let mut negatives: Vec<i32> =
                mem::take(&mut negative_sets[user_index]).into_iter().collect();
            negatives.sort_unstable();
            for item_index in negatives {
                click.push_row(user_index as i32, item_index, -1);
            }
        }
        debug!(
            n_valid_positive = click.positive_count,
            n_valid_negative = click.negative_count,
            used_time = ?start.elapsed(),
            "pulled read feedback from database"
        );
        self.task_monitor.update(TASK_LOAD_DATASET, 5);

        // Collect the latest items.
        let mut latest_items = HashMap::new();
        for (category, filter) in latest_filters {
            let (ids, scores) = filter.pop_all();
            latest_items.insert(category, create_scored(ids, scores));
        }

        // Collect popular items; hidden items never enter popularity.
        let mut popular_filters: HashMap<String, TopKStringFilter> = HashMap::new();
        popular_filters.insert(String::new(), TopKStringFilter::new(cache_size));
        for (item_index, &count) in popular_count.iter().enumerate() {
            if ranking.hidden_items[item_index] {
                continue;
            }
            let item_id = ranking.item_index.to_name(item_index as i32);
            if let Some(filter) = popular_filters.get_mut("") {
                filter.push(item_id.to_string(), count as f64);
            }
            for category in &ranking.item_categories[item_index] {
                popular_filters
                    .entry(category.clone())
                    .or_insert_with(|| TopKStringFilter::new(cache_size))
                    .push(item_id.to_string(), count as f64);
            }
        }
        let mut popular_items = HashMap::new();
        for (category, filter) in popular_filters {
            let (ids, scores) = filter.pop_all();
            popular_items.insert(category, create_scored(ids, scores));
        }

        self.task_monitor.finish(TASK_LOAD_DATASET);
        Ok(LoadedData {
            ranking,
            click,
            latest_items,
            popular_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::test_util::{seeded_data_store, test_master};
    use crate::jobs::monitor::TASK_LOAD_DATASET;
    use crate::jobs::CycleState;
    use crate::storage::cache::CacheStore;

    #[tokio::test]
    async fn test_load_builds_datasets_and_lists() {
        let (master, _cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();

        let guard = master.ranking_data.read().await;
        assert_eq!(guard.train.user_count(), 3);
        assert_eq!(guard.train.item_count(), 4);
        assert!(guard.train.count() > 0);
        assert_eq!(guard.test.count(), 0);
        drop(guard);

        let guard = master.click_data.read().await;
        assert!(guard.train.count() + guard.test.count() > 0);
        drop(guard);

        let task = master.task_monitor.get(TASK_LOAD_DATASET).unwrap();
        assert_eq!(task.current, 5);
    }

    #[tokio::test]
    async fn test_load_writes_cache_lists_and_stats() {
        let (master, cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();

        let popular = cache.get_sorted(POPULAR_ITEMS, 0, -1).await.unwrap();
        assert!(!popular.is_empty());
        // Hidden items never appear in popularity.
        assert!(popular.iter().all(|s| s.id != "hidden"));
        for pair in popular.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let latest = cache.get_sorted(LATEST_ITEMS, 0, -1).await.unwrap();
        assert!(!latest.is_empty());
        assert!(latest.iter().all(|s| s.id != "hidden"));

        assert_eq!(cache.get_int(GLOBAL_META, NUM_USERS).await.unwrap(), 3);
        assert_eq!(cache.get_int(GLOBAL_META, NUM_ITEMS).await.unwrap(), 4);
        assert!(cache
            .get_time(GLOBAL_META, LAST_UPDATE_POPULAR_ITEMS_TIME)
            .await
            .is_ok());

        let categories = cache.get_set(ITEM_CATEGORIES).await.unwrap();
        assert_eq!(categories, vec!["news".to_string(), "video".to_string()]);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (master, cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();
        let users_first = cache.get_int(GLOBAL_META, NUM_USERS).await.unwrap();
        let feedback_first = cache
            .get_int(GLOBAL_META, NUM_TOTAL_POS_FEEDBACKS)
            .await
            .unwrap();
        let popular_first = cache.get_sorted(POPULAR_ITEMS, 0, -1).await.unwrap();
        let latest_first = cache.get_sorted(LATEST_ITEMS, 0, -1).await.unwrap();

        master.run_load_dataset_task().await.unwrap();
        assert_eq!(cache.get_int(GLOBAL_META, NUM_USERS).await.unwrap(), users_first);
        assert_eq!(
            cache.get_int(GLOBAL_META, NUM_TOTAL_POS_FEEDBACKS).await.unwrap(),
            feedback_first
        );
        assert_eq!(cache.get_sorted(POPULAR_ITEMS, 0, -1).await.unwrap(), popular_first);
        assert_eq!(cache.get_sorted(LATEST_ITEMS, 0, -1).await.unwrap(), latest_first);
    }

    #[tokio::test]
    async fn test_popularity_reclaim_keeps_head() {
        let (mut master, cache) = test_master(seeded_data_store()).await;
        master.config.database.cache_size = 2;
        // A stale low-score entry from a previous run.
        cache
            .add_sorted(
                POPULAR_ITEMS,
                &[Scored { id: "stale".into(), score: -10.0 }],
            )
            .await
            .unwrap();
        master.run_load_dataset_task().await.unwrap();

        let popular = cache.get_sorted(POPULAR_ITEMS, 0, -1).await.unwrap();
        assert_eq!(popular.len(), 2);
        assert!(popular.iter().all(|s| s.id != "stale"));
    }

    #[tokio::test]
    async fn test_cycle_runs_load_first() {
        let (master, cache) = test_master(seeded_data_store()).await;
        let mut state = CycleState::default();
        master.run_cycle(&mut state).await;
        assert!(cache.get_int(GLOBAL_META, NUM_USERS).await.unwrap() > 0);
        assert_ne!(state.ranking.users, 0);
    }
}
