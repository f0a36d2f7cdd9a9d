//! Local persistence of the best models between restarts. One bincode file
//! holds both model families with their names, versions and scores.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::{ClickScore, RankingScore};
use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LocalCache {
    #[serde(skip)]
    path: PathBuf,
    pub ranking_model: Option<Vec<u8>>,
    pub ranking_model_name: String,
    pub ranking_model_version: u64,
    pub ranking_model_score: RankingScore,
    pub click_model: Option<Vec<u8>>,
    pub click_model_version: u64,
    pub click_model_score: ClickScore,
}

impl LocalCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load a previously written cache file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let mut cache: LocalCache = bincode::deserialize(&bytes)?;
        cache.path = path.as_ref().to_path_buf();
        Ok(cache)
    }

    /// Write atomically: serialize to a sibling temp file, then rename.
    pub fn write(&self) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
