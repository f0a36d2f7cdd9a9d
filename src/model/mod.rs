//! Contracts of the two trained model families and their hyper-parameter
//! searchers. The numerical fitting routines live outside this crate; the
//! orchestrator only sequences fits, compares scores and persists winners.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dataset::{ClickDataset, RankingDataset};
use crate::error::Result;
use crate::jobs::monitor::{TaskRunner, TaskTracker};

pub mod local_cache;

pub use local_cache::LocalCache;

/// Quality scores of the collaborative filtering model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingScore {
    pub ndcg: f32,
    pub precision: f32,
    pub recall: f32,
}

/// Quality scores of the click-through rate model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickScore {
    pub precision: f32,
    pub recall: f32,
    pub auc: f32,
}

/// Hyper-parameters with a stable string form; two models with equal
/// parameter maps render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams(pub BTreeMap<String, String>);

impl fmt::Display for ModelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FitConfig {
    pub jobs: usize,
    pub tracker: Option<TaskTracker>,
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

pub trait RankingModel: Send + Sync {
    fn fit(
        &mut self,
        train: &RankingDataset,
        test: &RankingDataset,
        config: &FitConfig,
    ) -> RankingScore;

    fn params(&self) -> ModelParams;

    /// True until the model has been fitted at least once.
    fn invalid(&self) -> bool;

    fn clone_model(&self) -> Box<dyn RankingModel>;

    /// Opaque serialized form for the local cache; must round-trip lossless
    /// through the matching deserializer of the implementation.
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

pub trait ClickModel: Send + Sync {
    fn fit(&mut self, train: &ClickDataset, test: &ClickDataset, config: &FitConfig) -> ClickScore;

    fn params(&self) -> ModelParams;

    fn invalid(&self) -> bool;

    fn clone_model(&self) -> Box<dyn ClickModel>;

    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Hyper-parameter search over collaborative filtering models.
#[async_trait]
pub trait RankingModelSearcher: Send + Sync {
    async fn fit(
        &self,
        train: Arc<RankingDataset>,
        test: Arc<RankingDataset>,
        tracker: TaskTracker,
        runner: TaskRunner,
    ) -> Result<()>;

    /// The best candidate produced so far, if any.
    fn best_model(&self) -> Option<(String, Box<dyn RankingModel>, RankingScore)>;
}

/// Hyper-parameter search over click-through rate models.
#[async_trait]
pub trait ClickModelSearcher: Send + Sync {
    async fn fit(
        &self,
        train: Arc<ClickDataset>,
        test: Arc<ClickDataset>,
        tracker: TaskTracker,
        runner: TaskRunner,
    ) -> Result<()>;

    fn best_model(&self) -> Option<(Box<dyn ClickModel>, ClickScore)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_display_is_stable() {
        let mut map = BTreeMap::new();
        map.insert("n_factors".to_string(), "16".to_string());
        map.insert("lr".to_string(), "0.05".to_string());
        let params = ModelParams(map);
        // BTreeMap iteration is ordered, so the rendering never flips.
        assert_eq!(params.to_string(), "lr=0.05,n_factors=16");
    }

    #[test]
    fn test_empty_params_display() {
        assert_eq!(ModelParams::default().to_string(), "");
    }
}
