//! Neighbor engine: for each user and each item, compute the top-K nearest
//! entities under one of three similarity regimes.
//!
//! Candidates come either from a brute-force walk over label/feedback
//! postings or from an approximate inverted-file index. Per entity, the
//! worker writes all neighbor sorted sets before the per-entity update
//! timestamp; the global sweep marker is written only when the whole sweep
//! succeeded. Entities whose cache is still fresh are skipped silently.

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::Master;
use crate::config::NeighborType;
use crate::dataset::RankingDataset;
use crate::error::{AppError, Result};
use crate::heap::TopKFilter;
use crate::jobs::monitor::{TaskMonitor, TASK_FIND_ITEM_NEIGHBORS, TASK_FIND_USER_NEIGHBORS};
use crate::metrics;
use crate::search::{self, DictionaryVector, IvfBuilder, IvfIndex, VectorIndex};
use crate::storage::cache::{
    create_scored, key, CacheStore, GLOBAL_META, ITEM_NEIGHBORS, ITEM_NEIGHBOR_INDEX_RECALL,
    LAST_MODIFY_ITEM_TIME, LAST_MODIFY_USER_TIME, LAST_UPDATE_ITEM_NEIGHBORS_TIME,
    LAST_UPDATE_USER_NEIGHBORS_TIME, USER_NEIGHBORS, USER_NEIGHBOR_INDEX_RECALL,
};

/// Test size of the recall evaluation sample during index builds.
const INDEX_TEST_SIZE: usize = 1000;

fn spawn_progress_ticker(
    monitor: Arc<TaskMonitor>,
    name: &'static str,
    total: usize,
    mut completed: mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut completed_count = 0usize;
        let mut previous_count = 0usize;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                received = completed.recv() => match received {
                    Some(()) => completed_count += 1,
                    None => return,
                },
                _ = ticker.tick() => {
                    let throughput = completed_count - previous_count;
                    previous_count = completed_count;
                    if throughput > 0 {
                        monitor.update(name, completed_count);
                        debug!(
                            task = name,
                            n_complete = completed_count,
                            n_total = total,
                            throughput,
                            "searching neighbors"
                        );
                    }
                }
            }
        }
    })
}

/// Inverse document frequency of each posting list: `ln(total / |postings|)`.
fn inverse_document_frequency(postings_lengths: impl Iterator<Item = usize>, total: usize) -> Vec<f32> {
    postings_lengths
        .map(|len| (total as f32 / len as f32).ln())
        .collect()
}

impl Master {
    /// Update neighbors of items.
    pub async fn run_find_item_neighbors_task(&self, dataset: &Arc<RankingDataset>) {
        let item_count = dataset.item_count();
        self.task_monitor.start(TASK_FIND_ITEM_NEIGHBORS, item_count);
        info!(
            n_cache = self.config.database.cache_size,
            "start searching neighbors of items"
        );
        let (completed_tx, completed_rx) = mpsc::channel(1024);
        let ticker = spawn_progress_ticker(
            self.task_monitor.clone(),
            TASK_FIND_ITEM_NEIGHBORS,
            item_count,
            completed_rx,
        );

        let neighbor_type = self.config.recommend.item_neighbor_type;
        let mut user_idf = Vec::new();
        if matches!(neighbor_type, NeighborType::Related | NeighborType::Auto) {
            user_idf = inverse_document_frequency(
                dataset.user_feedback.iter().map(Vec::len),
                item_count,
            );
        }
        let mut labeled_items: Vec<Vec<i32>> = vec![Vec::new(); dataset.num_item_labels as usize];
        let mut label_idf = Vec::new();
        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            for (item, labels) in dataset.item_labels.iter().enumerate() {
                for &label in labels {
                    labeled_items[label as usize].push(item as i32);
                }
            }
            label_idf =
                inverse_document_frequency(labeled_items.iter().map(Vec::len), item_count);
        }

        let start = Instant::now();
        let result = if self.config.recommend.enable_item_neighbor_index {
            self.find_item_neighbors_ivf(dataset, label_idf, user_idf, completed_tx)
                .await
        } else {
            self.find_item_neighbors_brute_force(
                dataset,
                &labeled_items,
                &label_idf,
                &user_idf,
                completed_tx,
            )
            .await
        };
        let search_time = start.elapsed();
        let _ = ticker.await;

        match result {
            Err(err) => {
                error!(error = %err, "failed to search neighbors of items");
                self.task_monitor
                    .fail(TASK_FIND_ITEM_NEIGHBORS, &err.to_string());
            }
            Ok(()) => {
                if let Err(err) = self
                    .cache_store
                    .set_time(GLOBAL_META, LAST_UPDATE_ITEM_NEIGHBORS_TIME, Utc::now())
                    .await
                {
                    error!(error = %err, "failed to set item neighbors update time");
                }
                info!(search_time = ?search_time, "complete searching neighbors of items");
                self.task_monitor.finish(TASK_FIND_ITEM_NEIGHBORS);
            }
        }
    }

    async fn find_item_neighbors_brute_force(
        &self,
        dataset: &RankingDataset,
        labeled_items: &[Vec<i32>],
        label_idf: &[f32],
        user_idf: &[f32],
        completed: mpsc::Sender<()>,
    ) -> Result<()> {
        let categories: Vec<String> = dataset.category_set.iter().cloned().collect();
        let first_error: Mutex<Option<AppError>> = Mutex::new(None);

        futures::stream::iter(0..dataset.item_count())
            .for_each_concurrent(self.config.master.num_jobs.max(1), |item_id| {
                let completed = completed.clone();
                let categories = &categories;
                let first_error = &first_error;
                async move {
                    let result = self
                        .search_item_neighbors_brute_force(
                            dataset,
                            labeled_items,
                            label_idf,
                            user_idf,
                            categories,
                            item_id,
                        )
                        .await;
                    if let Err(err) = result {
                        error!(error = %err, item_id, "failed to search neighbors of item");
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    let _ = completed.send(()).await;
                }
            })
            .await;

        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn search_item_neighbors_brute_force(
        &self,
        dataset: &RankingDataset,
        labeled_items: &[Vec<i32>],
        label_idf: &[f32],
        user_idf: &[f32],
        categories: &[String],
        item_id: usize,
    ) -> Result<()> {
        let item_name = dataset.item_index.to_name(item_id as i32);
        if !self.is_item_neighbors_stale(item_name, categories).await {
            return Ok(());
        }
        let start = Instant::now();
        let neighbor_type = self.config.recommend.item_neighbor_type;
        let cache_size = self.config.database.cache_size;
        let mut filters: HashMap<&str, TopKFilter> = HashMap::new();
        filters.insert("", TopKFilter::new(cache_size));
        for category in categories {
            filters.insert(category, TopKFilter::new(cache_size));
        }

        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            for candidate in
                adjacent_entities(&dataset.item_labels[item_id], labeled_items, dataset.item_count())
            {
                if candidate as usize != item_id && !dataset.hidden_items[candidate as usize] {
                    let score = search::similarity(
                        &dataset.item_labels[item_id],
                        &dataset.item_labels[candidate as usize],
                        label_idf,
                    );
                    if score > 0.0 {
                        push_item(&mut filters, dataset, candidate, score);
                    }
                }
            }
        }

        let no_global = filters.get("").map_or(true, TopKFilter::is_empty);
        if neighbor_type == NeighborType::Related
            || (neighbor_type == NeighborType::Auto && no_global)
        {
            for candidate in adjacent_entities(
                &dataset.item_feedback[item_id],
                &dataset.user_feedback,
                dataset.item_count(),
            ) {
                if candidate as usize != item_id && !dataset.hidden_items[candidate as usize] {
                    let score = search::similarity(
                        &dataset.item_feedback[item_id],
                        &dataset.item_feedback[candidate as usize],
                        user_idf,
                    );
                    if score > 0.0 {
                        push_item(&mut filters, dataset, candidate, score);
                    }
                }
            }
        }

        for (category, filter) in filters {
            let (ids, scores) = filter.pop_all();
            let names = ids
                .iter()
                .map(|&id| dataset.item_index.to_name(id).to_string())
                .collect();
            let scored = create_scored(names, scores.into_iter().map(f64::from).collect());
            self.cache_store
                .set_sorted(&key(&[ITEM_NEIGHBORS, item_name, category]), &scored)
                .await?;
        }
        self.cache_store
            .set_time(LAST_UPDATE_ITEM_NEIGHBORS_TIME, item_name, Utc::now())
            .await?;
        metrics::FIND_ITEM_NEIGHBORS_SECONDS.observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn find_item_neighbors_ivf(
        &self,
        dataset: &Arc<RankingDataset>,
        label_idf: Vec<f32>,
        user_idf: Vec<f32>,
        completed: mpsc::Sender<()>,
    ) -> Result<()> {
        let neighbor_type = self.config.recommend.item_neighbor_type;
        let cache_size = self.config.database.cache_size;
        let categories: Vec<String> = dataset.category_set.iter().cloned().collect();

        let mut similar_index: Option<Arc<IvfIndex>> = None;
        let mut related_index: Option<Arc<IvfIndex>> = None;
        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            let weights = Arc::new(label_idf);
            let vectors: Vec<DictionaryVector> = (0..dataset.item_count())
                .map(|item| {
                    DictionaryVector::new(
                        dataset.item_labels[item].clone(),
                        weights.clone(),
                        dataset.item_categories[item].clone(),
                        dataset.hidden_items[item],
                    )
                })
                .collect();
            let (index, recall) = self
                .build_index(
                    vectors,
                    self.config.recommend.item_neighbor_index_recall,
                    self.config.recommend.item_neighbor_index_fit_epoch,
                )
                .await?;
            metrics::ITEM_NEIGHBOR_INDEX_RECALL.set(recall as f64);
            self.cache_store
                .set_string(GLOBAL_META, ITEM_NEIGHBOR_INDEX_RECALL, &recall.to_string())
                .await?;
            similar_index = Some(Arc::new(index));
        }
        if matches!(neighbor_type, NeighborType::Related | NeighborType::Auto) {
            let weights = Arc::new(user_idf);
            let vectors: Vec<DictionaryVector> = (0..dataset.item_count())
                .map(|item| {
                    DictionaryVector::new(
                        dataset.item_feedback[item].clone(),
                        weights.clone(),
                        dataset.item_categories[item].clone(),
                        dataset.hidden_items[item],
                    )
                })
                .collect();
            let (index, _) = self
                .build_index(
                    vectors,
                    self.config.recommend.item_neighbor_index_recall,
                    self.config.recommend.item_neighbor_index_fit_epoch,
                )
                .await?;
            related_index = Some(Arc::new(index));
        }

        let first_error: Mutex<Option<AppError>> = Mutex::new(None);
        futures::stream::iter(0..dataset.item_count())
            .for_each_concurrent(self.config.master.num_jobs.max(1), |item_id| {
                let completed = completed.clone();
                let categories = &categories;
                let first_error = &first_error;
                let similar_index = similar_index.clone();
                let related_index = related_index.clone();
                async move {
                    let item_name = dataset.item_index.to_name(item_id as i32);
                    if !self.is_item_neighbors_stale(item_name, categories).await {
                        let _ = completed.send(()).await;
                        return;
                    }
                    let start = Instant::now();
                    let mut neighbors: HashMap<String, Vec<i32>> = HashMap::new();
                    let mut distances: HashMap<String, Vec<f32>> = HashMap::new();
                    if let Some(index) = &similar_index {
                        (neighbors, distances) =
                            index.multi_search(item_id, categories, cache_size, true);
                    }
                    let no_global = neighbors.get("").map_or(true, Vec::is_empty);
                    if let Some(index) = &related_index {
                        if neighbor_type == NeighborType::Related
                            || (neighbor_type == NeighborType::Auto && no_global)
                        {
                            (neighbors, distances) =
                                index.multi_search(item_id, categories, cache_size, true);
                        }
                    }
                    let result = self
                        .write_item_neighbors(dataset, item_name, &neighbors, &distances)
                        .await;
                    if let Err(err) = result {
                        error!(error = %err, item_id, "failed to search neighbors of item");
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    metrics::FIND_ITEM_NEIGHBORS_SECONDS.observe(start.elapsed().as_secs_f64());
                    let _ = completed.send(()).await;
                }
            })
            .await;

        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn write_item_neighbors(
        &self,
        dataset: &RankingDataset,
        item_name: &str,
        neighbors: &HashMap<String, Vec<i32>>,
        distances: &HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        for (category, ids) in neighbors {
            if ids.is_empty() {
                continue;
            }
            let names = ids
                .iter()
                .map(|&id| dataset.item_index.to_name(id).to_string())
                .collect();
            // The index returns distances; negate back to descending scores.
            let scores = distances[category].iter().map(|&d| -d as f64).collect();
            let scored = create_scored(names, scores);
            self.cache_store
                .set_sorted(&key(&[ITEM_NEIGHBORS, item_name, category]), &scored)
                .await?;
        }
        self.cache_store
            .set_time(LAST_UPDATE_ITEM_NEIGHBORS_TIME, item_name, Utc::now())
            .await?;
        Ok(())
    }

    async fn build_index(
        &self,
        vectors: Vec<DictionaryVector>,
        recall_target: f32,
        fit_epochs: usize,
    ) -> Result<(IvfIndex, f32)> {
        let builder = IvfBuilder::new(vectors, self.config.database.cache_size, INDEX_TEST_SIZE)
            .with_jobs(self.config.master.num_jobs);
        tokio::task::spawn_blocking(move || builder.build(recall_target, fit_epochs))
            .await
            .map_err(|err| AppError::Internal(format!("index build failed: {}", err)))
    }

    /// Update neighbors of users.
    pub async fn run_find_user_neighbors_task(&self, dataset: &Arc<RankingDataset>) {
        let user_count = dataset.user_count();
        self.task_monitor.start(TASK_FIND_USER_NEIGHBORS, user_count);
        info!(
            n_cache = self.config.database.cache_size,
            "start searching neighbors of users"
        );
        let (completed_tx, completed_rx) = mpsc::channel(1024);
        let ticker = spawn_progress_ticker(
            self.task_monitor.clone(),
            TASK_FIND_USER_NEIGHBORS,
            user_count,
            completed_rx,
        );

        let neighbor_type = self.config.recommend.user_neighbor_type;
        let mut item_idf = Vec::new();
        if matches!(neighbor_type, NeighborType::Related | NeighborType::Auto) {
            item_idf = inverse_document_frequency(
                dataset.item_feedback.iter().map(Vec::len),
                user_count,
            );
        }
        let mut labeled_users: Vec<Vec<i32>> = vec![Vec::new(); dataset.num_user_labels as usize];
        let mut label_idf = Vec::new();
        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            for (user, labels) in dataset.user_labels.iter().enumerate() {
                for &label in labels {
                    labeled_users[label as usize].push(user as i32);
                }
            }
            label_idf =
                inverse_document_frequency(labeled_users.iter().map(Vec::len), user_count);
        }

        let start = Instant::now();
        let result = if self.config.recommend.enable_user_neighbor_index {
            self.find_user_neighbors_ivf(dataset, label_idf, item_idf, completed_tx)
                .await
        } else {
            self.find_user_neighbors_brute_force(
                dataset,
                &labeled_users,
                &label_idf,
                &item_idf,
                completed_tx,
            )
            .await
        };
        let search_time = start.elapsed();
        let _ = ticker.await;

        match result {
            Err(err) => {
                error!(error = %err, "failed to search neighbors of users");
                self.task_monitor
                    .fail(TASK_FIND_USER_NEIGHBORS, &err.to_string());
            }
            Ok(()) => {
                if let Err(err) = self
                    .cache_store
                    .set_time(GLOBAL_META, LAST_UPDATE_USER_NEIGHBORS_TIME, Utc::now())
                    .await
                {
                    error!(error = %err, "failed to set user neighbors update time");
                }
                info!(search_time = ?search_time, "complete searching neighbors of users");
                self.task_monitor.finish(TASK_FIND_USER_NEIGHBORS);
            }
        }
    }

    async fn find_user_neighbors_brute_force(
        &self,
        dataset: &RankingDataset,
        labeled_users: &[Vec<i32>],
        label_idf: &[f32],
        item_idf: &[f32],
        completed: mpsc::Sender<()>,
    ) -> Result<()> {
        let first_error: Mutex<Option<AppError>> = Mutex::new(None);

        futures::stream::iter(0..dataset.user_count())
            .for_each_concurrent(self.config.master.num_jobs.max(1), |user_id| {
                let completed = completed.clone();
                let first_error = &first_error;
                async move {
                    let result = self
                        .search_user_neighbors_brute_force(
                            dataset,
                            labeled_users,
                            label_idf,
                            item_idf,
                            user_id,
                        )
                        .await;
                    if let Err(err) = result {
                        error!(error = %err, user_id, "failed to search neighbors of user");
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    let _ = completed.send(()).await;
                }
            })
            .await;

        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn search_user_neighbors_brute_force(
        &self,
        dataset: &RankingDataset,
        labeled_users: &[Vec<i32>],
        label_idf: &[f32],
        item_idf: &[f32],
        user_id: usize,
    ) -> Result<()> {
        let user_name = dataset.user_index.to_name(user_id as i32);
        if !self.is_user_neighbors_stale(user_name).await {
            return Ok(());
        }
        let start = Instant::now();
        let neighbor_type = self.config.recommend.user_neighbor_type;
        let mut near_users = TopKFilter::new(self.config.database.cache_size);

        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            for candidate in
                adjacent_entities(&dataset.user_labels[user_id], labeled_users, dataset.user_count())
            {
                if candidate as usize != user_id {
                    let score = search::similarity(
                        &dataset.user_labels[user_id],
                        &dataset.user_labels[candidate as usize],
                        label_idf,
                    );
                    if score > 0.0 {
                        near_users.push(candidate, score);
                    }
                }
            }
        }

        if neighbor_type == NeighborType::Related
            || (neighbor_type == NeighborType::Auto && near_users.is_empty())
        {
            for candidate in adjacent_entities(
                &dataset.user_feedback[user_id],
                &dataset.item_feedback,
                dataset.user_count(),
            ) {
                if candidate as usize != user_id {
                    let score = search::similarity(
                        &dataset.user_feedback[user_id],
                        &dataset.user_feedback[candidate as usize],
                        item_idf,
                    );
                    if score > 0.0 {
                        near_users.push(candidate, score);
                    }
                }
            }
        }

        let (ids, scores) = near_users.pop_all();
        let names = ids
            .iter()
            .map(|&id| dataset.user_index.to_name(id).to_string())
            .collect();
        let scored = create_scored(names, scores.into_iter().map(f64::from).collect());
        self.cache_store
            .set_sorted(&key(&[USER_NEIGHBORS, user_name]), &scored)
            .await?;
        self.cache_store
            .set_time(LAST_UPDATE_USER_NEIGHBORS_TIME, user_name, Utc::now())
            .await?;
        metrics::FIND_USER_NEIGHBORS_SECONDS.observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn find_user_neighbors_ivf(
        &self,
        dataset: &Arc<RankingDataset>,
        label_idf: Vec<f32>,
        item_idf: Vec<f32>,
        completed: mpsc::Sender<()>,
    ) -> Result<()> {
        let neighbor_type = self.config.recommend.user_neighbor_type;
        let cache_size = self.config.database.cache_size;

        let mut similar_index: Option<Arc<IvfIndex>> = None;
        let mut related_index: Option<Arc<IvfIndex>> = None;
        if matches!(neighbor_type, NeighborType::Similar | NeighborType::Auto) {
            let weights = Arc::new(label_idf);
            let vectors: Vec<DictionaryVector> = (0..dataset.user_count())
                .map(|user| {
                    DictionaryVector::new(
                        dataset.user_labels[user].clone(),
                        weights.clone(),
                        Vec::new(),
                        false,
                    )
                })
                .collect();
            let (index, recall) = self
                .build_index(
                    vectors,
                    self.config.recommend.user_neighbor_index_recall,
                    self.config.recommend.user_neighbor_index_fit_epoch,
                )
                .await?;
            metrics::USER_NEIGHBOR_INDEX_RECALL.set(recall as f64);
            self.cache_store
                .set_string(GLOBAL_META, USER_NEIGHBOR_INDEX_RECALL, &recall.to_string())
                .await?;
            similar_index = Some(Arc::new(index));
        }
        if matches!(neighbor_type, NeighborType::Related | NeighborType::Auto) {
            let weights = Arc::new(item_idf);
            let vectors: Vec<DictionaryVector> = (0..dataset.user_count())
                .map(|user| {
                    DictionaryVector::new(
                        dataset.user_feedback[user].clone(),
                        weights.clone(),
                        Vec::new(),
                        false,
                    )
                })
                .collect();
            let (index, _) = self
                .build_index(
                    vectors,
                    self.config.recommend.user_neighbor_index_recall,
                    self.config.recommend.user_neighbor_index_fit_epoch,
                )
                .await?;
            related_index = Some(Arc::new(index));
        }

        let first_error: Mutex<Option<AppError>> = Mutex::new(None);
        futures::stream::iter(0..dataset.user_count())
            .for_each_concurrent(self.config.master.num_jobs.max(1), |user_id| {
                let completed = completed.clone();
                let first_error = &first_error;
                let similar_index = similar_index.clone();
                let related_index = related_index.clone();
                async move {
                    let user_name = dataset.user_index.to_name(user_id as i32);
                    if !self.is_user_neighbors_stale(user_name).await {
                        let _ = completed.send(()).await;
                        return;
                    }
                    let start = Instant::now();
                    let mut neighbors = Vec::new();
                    let mut dists = Vec::new();
                    if let Some(index) = &similar_index {
                        (neighbors, dists) = index.search(user_id, cache_size, true);
                    }
                    if let Some(index) = &related_index {
                        if neighbor_type == NeighborType::Related
                            || (neighbor_type == NeighborType::Auto && neighbors.is_empty())
                        {
                            (neighbors, dists) = index.search(user_id, cache_size, true);
                        }
                    }
                    let names = neighbors
                        .iter()
                        .map(|&id| dataset.user_index.to_name(id).to_string())
                        .collect();
                    let scores = dists.iter().map(|&d| -d as f64).collect();
                    let scored = create_scored(names, scores);
                    let result = async {
                        self.cache_store
                            .set_sorted(&key(&[USER_NEIGHBORS, user_name]), &scored)
                            .await?;
                        self.cache_store
                            .set_time(LAST_UPDATE_USER_NEIGHBORS_TIME, user_name, Utc::now())
                            .await
                    }
                    .await;
                    if let Err(err) = result {
                        error!(error = %err, user_id, "failed to search neighbors of user");
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                    metrics::FIND_USER_NEIGHBORS_SECONDS.observe(start.elapsed().as_secs_f64());
                    let _ = completed.send(()).await;
                }
            })
            .await;

        match first_error.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A user is stale when its timestamps cannot be read or its neighbors
    /// were updated at or before the last modification.
    pub async fn is_user_neighbors_stale(&self, user_id: &str) -> bool {
        let modify_time = match self
            .cache_store
            .get_time(LAST_MODIFY_USER_TIME, user_id)
            .await
        {
            Ok(time) => time,
            Err(err) => {
                debug!(error = %err, user_id, "failed to read modify time");
                return true;
            }
        };
        let update_time = match self
            .cache_store
            .get_time(LAST_UPDATE_USER_NEIGHBORS_TIME, user_id)
            .await
        {
            Ok(time) => time,
            Err(err) => {
                debug!(error = %err, user_id, "failed to read update time");
                return true;
            }
        };
        update_time.timestamp() <= modify_time.timestamp()
    }

    /// An item is additionally stale when any of its neighbor sorted sets,
    /// global or per known category, is missing or empty.
    pub async fn is_item_neighbors_stale(&self, item_id: &str, categories: &[String]) -> bool {
        for category in std::iter::once("").chain(categories.iter().map(String::as_str)) {
            match self
                .cache_store
                .get_sorted(&key(&[ITEM_NEIGHBORS, item_id, category]), 0, -1)
                .await
            {
                Ok(items) if items.is_empty() => return true,
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, item_id, "failed to read item neighbors cache");
                    return true;
                }
            }
        }
        let modify_time = match self
            .cache_store
            .get_time(LAST_MODIFY_ITEM_TIME, item_id)
            .await
        {
            Ok(time) => time,
            Err(err) => {
                debug!(error = %err, item_id, "failed to read modify time");
                return true;
            }
        };
        let update_time = match self
            .cache_store
            .get_time(LAST_UPDATE_ITEM_NEIGHBORS_TIME, item_id)
            .await
        {
            Ok(time) => time,
            Err(err) => {
                debug!(error = %err, item_id, "failed to read update time");
                return true;
            }
        };
        update_time.timestamp() <= modify_time.timestamp()
    }
}

/// Walk the postings of every term of `terms`, deduplicating candidates with
/// a per-worker bitset.
fn adjacent_entities(terms: &[i32], postings: &[Vec<i32>], total: usize) -> Vec<i32> {
    let mut visited = vec![false; total];
    let mut adjacent = Vec::new();
    for &term in terms {
        for &candidate in &postings[term as usize] {
            if !visited[candidate as usize] {
                visited[candidate as usize] = true;
                adjacent.push(candidate);
            }
        }
    }
    adjacent
}

fn push_item(
    filters: &mut HashMap<&str, TopKFilter>,
    dataset: &RankingDataset,
    candidate: i32,
    score: f32,
) {
    if let Some(filter) = filters.get_mut("") {
        filter.push(candidate, score);
    }
    for category in &dataset.item_categories[candidate as usize] {
        if let Some(filter) = filters.get_mut(category.as_str()) {
            filter.push(candidate, score);
        }
    }
}
