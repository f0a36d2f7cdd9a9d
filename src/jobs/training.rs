//! Model fit and hyper-parameter search tasks.
//!
//! Fits run on a cloned model handle outside the model lock; the result
//! re-enters under the lock to bump the version and score. Each family's
//! local-cache write waits until the other family holds a valid model.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use super::{Counts, Master};
use crate::dataset::RankingDataset;
use crate::error::{AppError, Result};
use crate::jobs::monitor::{
    TASK_FIND_ITEM_NEIGHBORS, TASK_FIND_USER_NEIGHBORS, TASK_FIT_CLICK_MODEL,
    TASK_FIT_RANKING_MODEL, TASK_SEARCH_CLICK_MODEL, TASK_SEARCH_RANKING_MODEL,
};
use crate::metrics;
use crate::model::{ClickModel, FitConfig, RankingModel};
use crate::storage::cache::{
    CacheStore, GLOBAL_META, LAST_FIT_MATCHING_MODEL_TIME, LAST_FIT_RANKING_MODEL_TIME,
};

impl Master {
    /// Run the tasks that depend on the ranking dataset: neighbor sweeps and
    /// the collaborative filtering model fit. Holds the ranking-data read
    /// lock for the whole sequence and returns the observed counts for the
    /// next cycle's change detection.
    pub async fn run_ranking_related_tasks(&self, last: Counts) -> Result<Counts> {
        info!(
            n_jobs = self.config.master.num_jobs,
            "start fitting ranking model"
        );
        let guard = self.ranking_data.read().await;
        let train = guard.train.clone();
        let test = guard.test.clone();
        let counts = Counts {
            users: train.user_count(),
            items: train.item_count(),
            feedback: train.count(),
        };
        if counts.users == 0 && counts.items == 0 && counts.feedback == 0 {
            warn!(
                positive_feedback_types = ?self.config.database.positive_feedback_types,
                "empty ranking dataset"
            );
            return Ok(counts);
        }
        let users_changed = counts.users != last.users;
        let items_changed = counts.items != last.items;
        let feedback_changed = counts.feedback != last.feedback;

        // Promote a better candidate from the searcher: it must be valid,
        // differ from the current model, and strictly beat its NDCG.
        let mut model_changed = false;
        let best = self.ranking_searcher.best_model();
        let ranking_model: Box<dyn RankingModel> = {
            let mut state = self.ranking_state.lock().unwrap();
            if let Some((best_name, best_model, best_score)) = best {
                if !best_model.invalid()
                    && (best_name != state.name
                        || best_model.params().to_string() != state.model.params().to_string())
                    && best_score.ndcg > state.score.ndcg
                {
                    info!(
                        name = %best_name,
                        ndcg = best_score.ndcg,
                        params = %best_model.params(),
                        "find better ranking model"
                    );
                    state.model = best_model;
                    state.name = best_name;
                    state.score = best_score;
                    model_changed = true;
                }
            }
            state.model.clone_model()
        };

        // Collect neighbors of items.
        if counts.items == 0 {
            self.task_monitor
                .fail(TASK_FIND_ITEM_NEIGHBORS, "No item found.");
        } else if items_changed || feedback_changed {
            self.run_find_item_neighbors_task(&train).await;
        }
        // Collect neighbors of users.
        if counts.users == 0 {
            self.task_monitor
                .fail(TASK_FIND_USER_NEIGHBORS, "No user found.");
        } else if users_changed || feedback_changed {
            self.run_find_user_neighbors_task(&train).await;
        }

        if counts.feedback == 0 {
            self.task_monitor
                .fail(TASK_FIT_RANKING_MODEL, "No feedback found.");
            return Ok(counts);
        }
        if !feedback_changed && !model_changed {
            info!("nothing changed");
            return Ok(counts);
        }
        self.run_fit_ranking_model_task(ranking_model, train, test)
            .await?;
        Ok(counts)
    }

    pub(crate) async fn run_fit_ranking_model_task(
        &self,
        model: Box<dyn RankingModel>,
        train: Arc<RankingDataset>,
        test: Arc<RankingDataset>,
    ) -> Result<()> {
        let tracker = self.task_monitor.tracker(TASK_FIT_RANKING_MODEL);
        let config = FitConfig::new()
            .with_jobs(self.config.master.num_jobs)
            .with_tracker(tracker);
        let (model, score) = spawn_blocking(move || {
            let mut model = model;
            let score = model.fit(&train, &test, &config);
            (model, score)
        })
        .await
        .map_err(|err| AppError::Internal(format!("ranking model fit failed: {}", err)))?;

        let (name, version, bytes) = {
            let mut state = self.ranking_state.lock().unwrap();
            state.model = model;
            state.version += 1;
            state.score = score;
            (state.name.clone(), state.version, state.model.to_bytes())
        };
        info!(version = %format!("{:x}", version), "fit ranking model complete");
        metrics::MATCHING_TOP10_NDCG.set(score.ndcg as f64);
        metrics::MATCHING_TOP10_RECALL.set(score.recall as f64);
        metrics::MATCHING_TOP10_PRECISION.set(score.precision as f64);
        if let Err(err) = self
            .cache_store
            .set_time(GLOBAL_META, LAST_FIT_MATCHING_MODEL_TIME, Utc::now())
            .await
        {
            error!(error = %err, "failed to write meta");
        }

        // Stage the fitted model; the file is written once the click model
        // is available too.
        match bytes {
            Err(err) => error!(error = %err, "failed to serialize ranking model"),
            Ok(bytes) => {
                let mut local_cache = self.local_cache.lock().unwrap();
                local_cache.ranking_model = Some(bytes);
                local_cache.ranking_model_name = name;
                local_cache.ranking_model_version = version;
                local_cache.ranking_model_score = score;
                if local_cache.click_model.is_none() {
                    info!("wait click model");
                } else if let Err(err) = local_cache.write() {
                    error!(error = %err, "failed to write local cache");
                } else {
                    info!(
                        ranking_model_name = %local_cache.ranking_model_name,
                        ranking_model_version =
                            %format!("{:x}", local_cache.ranking_model_version),
                        ranking_model_score = local_cache.ranking_model_score.ndcg,
                        "write model to local cache"
                    );
                }
            }
        }
        Ok(())
    }

    /// Fit the click model when counts changed or the searcher promoted a
    /// candidate. Returns the observed counts for the next cycle.
    pub async fn run_fit_click_model_task(&self, last: Counts) -> Result<Counts> {
        info!(
            n_jobs = self.config.master.num_jobs,
            "prepare to fit click model"
        );
        let guard = self.click_data.read().await;
        let train = guard.train.clone();
        let test = guard.test.clone();
        let counts = Counts {
            users: train.user_count(),
            items: train.item_count(),
            feedback: train.count(),
        };
        if counts.users == 0 || counts.items == 0 || counts.feedback == 0 {
            warn!(
                positive_feedback_types = ?self.config.database.positive_feedback_types,
                "empty click dataset"
            );
            self.task_monitor
                .fail(TASK_FIT_CLICK_MODEL, "No feedback found.");
            return Ok(counts);
        }
        let mut should_fit = counts != last;

        // Promotion: valid, differing parameters, strictly higher precision.
        let best = self.click_searcher.best_model();
        let click_model: Box<dyn ClickModel> = {
            let mut state = self.click_state.lock().unwrap();
            if let Some((best_model, best_score)) = best {
                if !best_model.invalid()
                    && best_model.params().to_string() != state.model.params().to_string()
                    && best_score.precision > state.score.precision
                {
                    info!(
                        precision = best_score.precision,
                        recall = best_score.recall,
                        params = %best_model.params(),
                        "find better click model"
                    );
                    state.model = best_model;
                    state.score = best_score;
                    should_fit = true;
                }
            }
            state.model.clone_model()
        };

        if !should_fit {
            info!("nothing changed");
            return Ok(counts);
        }
        let tracker = self.task_monitor.tracker(TASK_FIT_CLICK_MODEL);
        let config = FitConfig::new()
            .with_jobs(self.config.master.num_jobs)
            .with_tracker(tracker);
        let (model, score) = spawn_blocking(move || {
            let mut model = click_model;
            let score = model.fit(&train, &test, &config);
            (model, score)
        })
        .await
        .map_err(|err| AppError::Internal(format!("click model fit failed: {}", err)))?;

        let (version, bytes) = {
            let mut state = self.click_state.lock().unwrap();
            state.model = model;
            state.version += 1;
            state.score = score;
            (state.version, state.model.to_bytes())
        };
        info!(version = %format!("{:x}", version), "fit click model complete");
        metrics::RANKING_PRECISION.set(score.precision as f64);
        metrics::RANKING_RECALL.set(score.recall as f64);
        metrics::RANKING_AUC.set(score.auc as f64);
        if let Err(err) = self
            .cache_store
            .set_time(GLOBAL_META, LAST_FIT_RANKING_MODEL_TIME, Utc::now())
            .await
        {
            error!(error = %err, "failed to write meta");
        }

        match bytes {
            Err(err) => error!(error = %err, "failed to serialize click model"),
            Ok(bytes) => {
                let mut local_cache = self.local_cache.lock().unwrap();
                local_cache.click_model = Some(bytes);
                local_cache.click_model_version = version;
                local_cache.click_model_score = score;
                if local_cache.ranking_model.is_none() {
                    info!("wait ranking model");
                } else if let Err(err) = local_cache.write() {
                    error!(error = %err, "failed to write local cache");
                } else {
                    info!(
                        click_model_version = %format!("{:x}", local_cache.click_model_version),
                        click_model_score = score.precision,
                        "write model to local cache"
                    );
                }
            }
        }
        Ok(counts)
    }

    /// Search hyper-parameters for the collaborative filtering model.
    /// No-op on unchanged counts; empty datasets fail the task.
    pub async fn run_search_ranking_model_task(&self, last: Counts) -> Result<Counts> {
        info!("start searching ranking model");
        let guard = self.ranking_data.read().await;
        let train = guard.train.clone();
        let test = guard.test.clone();
        let counts = Counts {
            users: train.user_count(),
            items: train.item_count(),
            feedback: train.count(),
        };
        if counts.users == 0 || counts.items == 0 || counts.feedback == 0 {
            warn!(
                positive_feedback_types = ?self.config.database.positive_feedback_types,
                "empty ranking dataset"
            );
            self.task_monitor
                .fail(TASK_SEARCH_RANKING_MODEL, "No feedback found.");
            return Ok(counts);
        }
        if counts == last {
            info!("ranking dataset not changed");
            return Ok(counts);
        }
        let tracker = self.task_monitor.tracker(TASK_SEARCH_RANKING_MODEL);
        let runner = self.task_scheduler.runner(TASK_SEARCH_RANKING_MODEL);
        self.ranking_searcher
            .fit(train, test, tracker, runner)
            .await?;
        Ok(counts)
    }

    /// Search hyper-parameters for the click model.
    pub async fn run_search_click_model_task(&self, last: Counts) -> Result<Counts> {
        info!("start searching click model");
        let guard = self.click_data.read().await;
        let train = guard.train.clone();
        let test = guard.test.clone();
        let counts = Counts {
            users: train.user_count(),
            items: train.item_count(),
            feedback: train.count(),
        };
        if counts.users == 0 || counts.items == 0 || counts.feedback == 0 {
            warn!(
                positive_feedback_types = ?self.config.database.positive_feedback_types,
                "empty click dataset"
            );
            self.task_monitor
                .fail(TASK_SEARCH_CLICK_MODEL, "No feedback found.");
            return Ok(counts);
        }
        if counts == last {
            info!("click dataset not changed");
            return Ok(counts);
        }
        let tracker = self.task_monitor.tracker(TASK_SEARCH_CLICK_MODEL);
        let runner = self.task_scheduler.runner(TASK_SEARCH_CLICK_MODEL);
        self.click_searcher.fit(train, test, tracker, runner).await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::monitor::TaskStatus;
    use crate::jobs::test_util::{
        seeded_data_store, test_master, test_master_with_searchers, MockRankingModel,
        StaticClickSearcher, StaticRankingSearcher,
    };
    use crate::model::{LocalCache, ModelParams, RankingScore};
    use crate::storage::data::memory::MemoryDataStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_fit_runs_on_feedback_change() {
        let (master, cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();
        let counts = master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();
        assert_eq!(counts.users, 3);
        assert!(counts.feedback > 0);
        {
            let state = master.ranking_state.lock().unwrap();
            assert_eq!(state.version, 1);
            assert!(!state.model.invalid());
        }
        assert!(cache
            .get_time(GLOBAL_META, LAST_FIT_MATCHING_MODEL_TIME)
            .await
            .is_ok());
        // The click model is still missing, so no file was written yet.
        let local_cache = master.local_cache.lock().unwrap();
        assert!(local_cache.ranking_model.is_some());
        assert!(local_cache.click_model.is_none());
    }

    #[tokio::test]
    async fn test_unchanged_counts_skip_fit() {
        let (master, _cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();
        let counts = master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();
        master.run_ranking_related_tasks(counts).await.unwrap();
        let state = master.ranking_state.lock().unwrap();
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_promotion_of_better_ranking_model() {
        let ranking_searcher = Arc::new(StaticRankingSearcher::default());
        let click_searcher = Arc::new(StaticClickSearcher::default());
        let (master, _cache) = test_master_with_searchers(
            seeded_data_store(),
            ranking_searcher.clone(),
            click_searcher,
        )
        .await;
        master.run_load_dataset_task().await.unwrap();
        let counts = master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();

        // A valid candidate with different parameters and a strictly better
        // NDCG gets promoted and refitted even though counts are unchanged.
        let mut candidate = MockRankingModel::new();
        candidate.fitted = true;
        candidate.params = ModelParams(BTreeMap::from([(
            "n_factors".to_string(),
            "64".to_string(),
        )]));
        candidate.score = RankingScore {
            ndcg: 0.9,
            precision: 0.5,
            recall: 0.5,
        };
        *ranking_searcher.best.lock().unwrap() = Some((
            "als".to_string(),
            candidate.clone(),
            candidate.score,
        ));
        master.run_ranking_related_tasks(counts).await.unwrap();
        let state = master.ranking_state.lock().unwrap();
        assert_eq!(state.name, "als");
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn test_worse_candidate_is_not_promoted() {
        let ranking_searcher = Arc::new(StaticRankingSearcher::default());
        let click_searcher = Arc::new(StaticClickSearcher::default());
        let (master, _cache) = test_master_with_searchers(
            seeded_data_store(),
            ranking_searcher.clone(),
            click_searcher,
        )
        .await;
        master.run_load_dataset_task().await.unwrap();
        let counts = master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();

        let mut candidate = MockRankingModel::new();
        candidate.fitted = true;
        candidate.params = ModelParams(BTreeMap::from([(
            "n_factors".to_string(),
            "64".to_string(),
        )]));
        candidate.score = RankingScore {
            ndcg: 0.01,
            precision: 0.01,
            recall: 0.01,
        };
        *ranking_searcher.best.lock().unwrap() = Some((
            "als".to_string(),
            candidate.clone(),
            candidate.score,
        ));
        master.run_ranking_related_tasks(counts).await.unwrap();
        let state = master.ranking_state.lock().unwrap();
        assert_eq!(state.name, "bpr");
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_click_fit_writes_local_cache_after_both_models() {
        let (master, _cache) = test_master(seeded_data_store()).await;
        master.run_load_dataset_task().await.unwrap();
        master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();
        master.run_fit_click_model_task(Counts::default()).await.unwrap();

        let path = {
            let local_cache = master.local_cache.lock().unwrap();
            assert!(local_cache.ranking_model.is_some());
            assert!(local_cache.click_model.is_some());
            assert_eq!(local_cache.click_model_version, 1);
            local_cache.path().to_path_buf()
        };
        let loaded = LocalCache::load(&path).unwrap();
        assert_eq!(loaded.ranking_model_name, "bpr");
        assert_eq!(loaded.ranking_model_version, 1);
        assert_eq!(loaded.click_model_version, 1);
        assert!(loaded.ranking_model.is_some());
        assert!(loaded.click_model.is_some());
    }

    #[tokio::test]
    async fn test_search_tasks_run_once_per_change() {
        let ranking_searcher = Arc::new(StaticRankingSearcher::default());
        let click_searcher = Arc::new(StaticClickSearcher::default());
        let (master, _cache) = test_master_with_searchers(
            seeded_data_store(),
            ranking_searcher.clone(),
            click_searcher.clone(),
        )
        .await;
        master.run_load_dataset_task().await.unwrap();

        let counts = master
            .run_search_ranking_model_task(Counts::default())
            .await
            .unwrap();
        assert_eq!(ranking_searcher.fits.load(Ordering::SeqCst), 1);
        master.run_search_ranking_model_task(counts).await.unwrap();
        assert_eq!(ranking_searcher.fits.load(Ordering::SeqCst), 1);

        let counts = master
            .run_search_click_model_task(Counts::default())
            .await
            .unwrap();
        assert_eq!(click_searcher.fits.load(Ordering::SeqCst), 1);
        master.run_search_click_model_task(counts).await.unwrap();
        assert_eq!(click_searcher.fits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_datasets_fail_tasks() {
        let (master, _cache) = test_master(Arc::new(MemoryDataStore::new())).await;
        master.run_load_dataset_task().await.unwrap();

        master
            .run_ranking_related_tasks(Counts::default())
            .await
            .unwrap();
        master.run_fit_click_model_task(Counts::default()).await.unwrap();
        master
            .run_search_ranking_model_task(Counts::default())
            .await
            .unwrap();
        master
            .run_search_click_model_task(Counts::default())
            .await
            .unwrap();

        for task in [
            TASK_FIT_CLICK_MODEL,
            TASK_SEARCH_RANKING_MODEL,
            TASK_SEARCH_CLICK_MODEL,
        ] {
            let info = master.task_monitor.get(task).unwrap();
            assert_eq!(info.status, TaskStatus::Failed("No feedback found.".into()));
        }
        // The ranking model kept its initial state.
        let state = master.ranking_state.lock().unwrap();
        assert_eq!(state.version, 0);
    }
}
