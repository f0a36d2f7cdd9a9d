//! The master's macro-tasks: dataset load, neighbor sweeps, model training
//! and hyper-parameter search, click-through rate analysis.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::error;

use crate::config::Config;
use crate::dataset::{ClickDataset, RankingDataset};
use crate::model::{
    ClickModel, ClickModelSearcher, ClickScore, LocalCache, RankingModel, RankingModelSearcher,
    RankingScore,
};
use crate::storage::cache::CacheStore;
use crate::storage::data::DataStore;

pub mod analyze;
pub mod load_dataset;
pub mod monitor;
pub mod neighbors;
pub mod training;

use monitor::{TaskMonitor, TaskScheduler, TASK_LOAD_DATASET};

/// Streaming cursor batch size.
pub(crate) const BATCH_SIZE: usize = 10_000;

/// Train/test snapshot swapped atomically under the data lock.
pub struct DatasetSplit<T> {
    pub train: Arc<T>,
    pub test: Arc<T>,
}

impl<T: Default> Default for DatasetSplit<T> {
    fn default() -> Self {
        Self {
            train: Arc::new(T::default()),
            test: Arc::new(T::default()),
        }
    }
}

pub struct RankingModelState {
    pub model: Box<dyn RankingModel>,
    pub name: String,
    pub version: u64,
    pub score: RankingScore,
}

pub struct ClickModelState {
    pub model: Box<dyn ClickModel>,
    pub version: u64,
    pub score: ClickScore,
}

/// Entity and feedback counts observed by a task, carried between cycles to
/// detect change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub users: usize,
    pub items: usize,
    pub feedback: usize,
}

/// Per-task-family change deltas threaded through consecutive cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleState {
    pub ranking: Counts,
    pub click: Counts,
    pub search_ranking: Counts,
    pub search_click: Counts,
}

/// Owner of the offline pipeline state: datasets, models, searchers and the
/// local model cache.
pub struct Master {
    pub config: Config,
    pub(crate) data_store: Arc<dyn DataStore>,
    pub(crate) cache_store: Arc<dyn CacheStore>,
    pub task_monitor: Arc<TaskMonitor>,
    pub task_scheduler: Arc<TaskScheduler>,

    pub(crate) ranking_data: RwLock<DatasetSplit<RankingDataset>>,
    pub(crate) click_data: RwLock<DatasetSplit<ClickDataset>>,

    pub(crate) ranking_state: Mutex<RankingModelState>,
    pub(crate) click_state: Mutex<ClickModelState>,

    pub(crate) ranking_searcher: Arc<dyn RankingModelSearcher>,
    pub(crate) click_searcher: Arc<dyn ClickModelSearcher>,

    pub(crate) local_cache: Mutex<LocalCache>,
}

impl Master {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        data_store: Arc<dyn DataStore>,
        cache_store: Arc<dyn CacheStore>,
        ranking_model: Box<dyn RankingModel>,
        ranking_model_name: &str,
        click_model: Box<dyn ClickModel>,
        ranking_searcher: Arc<dyn RankingModelSearcher>,
        click_searcher: Arc<dyn ClickModelSearcher>,
        local_cache_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            data_store,
            cache_store,
            task_monitor: Arc::new(TaskMonitor::new()),
            task_scheduler: Arc::new(TaskScheduler::new()),
            ranking_data: RwLock::new(DatasetSplit::default()),
            click_data: RwLock::new(DatasetSplit::default()),
            ranking_state: Mutex::new(RankingModelState {
                model: ranking_model,
                name: ranking_model_name.to_string(),
                version: 0,
                score: RankingScore::default(),
            }),
            click_state: Mutex::new(ClickModelState {
                model: click_model,
                version: 0,
                score: ClickScore::default(),
            }),
            ranking_searcher,
            click_searcher,
            local_cache: Mutex::new(LocalCache::new(local_cache_path)),
        }
    }

    /// Handle to the cache store shared with the serving tier.
    pub fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache_store.clone()
    }

    /// Snapshot of the current ranking train set.
    pub async fn ranking_train_set(&self) -> Arc<RankingDataset> {
        self.ranking_data.read().await.train.clone()
    }

    pub fn local_cache_path(&self) -> PathBuf {
        self.local_cache.lock().unwrap().path().to_path_buf()
    }

    /// One full pipeline cycle: dataset load, then the ranking-related tasks
    /// (neighbor sweeps and model fit), the click model fit, and both
    /// hyper-parameter searches. Task failures are reported through the
    /// monitor; the cycle continues with the previously loaded state.
    pub async fn run_cycle(&self, state: &mut CycleState) {
        if let Err(err) = self.run_load_dataset_task().await {
            error!(error = %err, "failed to load dataset");
            self.task_monitor.fail(TASK_LOAD_DATASET, &err.to_string());
            return;
        }
        match self.run_ranking_related_tasks(state.ranking).await {
            Ok(counts) => state.ranking = counts,
            Err(err) => error!(error = %err, "ranking related tasks failed"),
        }
        match self.run_fit_click_model_task(state.click).await {
            Ok(counts) => state.click = counts,
            Err(err) => error!(error = %err, "failed to fit click model"),
        }
        match self.run_search_ranking_model_task(state.search_ranking).await {
            Ok(counts) => state.search_ranking = counts,
            Err(err) => error!(error = %err, "failed to search ranking model"),
        }
        match self.run_search_click_model_task(state.search_click).await {
            Ok(counts) => state.search_click = counts,
            Err(err) => error!(error = %err, "failed to search click model"),
        }
    }
}
