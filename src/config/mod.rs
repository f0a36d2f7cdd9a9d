use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Regime used to compute neighbors of an entity.
///
/// `Similar` compares label vectors, `Related` compares feedback vectors,
/// `Auto` runs `Similar` first and falls back to `Related` when no global
/// neighbor was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborType {
    Similar,
    Related,
    Auto,
}

impl Default for NeighborType {
    fn default() -> Self {
        NeighborType::Auto
    }
}

impl FromStr for NeighborType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "similar" => Ok(NeighborType::Similar),
            "related" => Ok(NeighborType::Related),
            "auto" => Ok(NeighborType::Auto),
            other => Err(format!("unknown neighbor type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub master: MasterConfig,
    pub recommend: RecommendConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Feedback types that denote a positive preference.
    pub positive_feedback_types: Vec<String>,
    /// Feedback types that denote exposure without preference.
    pub read_feedback_types: Vec<String>,
    /// Items older than this many days are dropped from the dataset (0 keeps everything).
    pub item_ttl: u32,
    /// Positive feedback older than this many days is dropped (0 keeps everything).
    pub positive_feedback_ttl: u32,
    /// Maximum number of entries per cached list.
    pub cache_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            positive_feedback_types: Vec::new(),
            read_feedback_types: Vec::new(),
            item_ttl: 0,
            positive_feedback_ttl: 0,
            cache_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Number of concurrent workers inside a macro-task.
    pub num_jobs: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self { num_jobs: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendConfig {
    pub item_neighbor_type: NeighborType,
    pub user_neighbor_type: NeighborType,
    /// Use the approximate inverted-file index instead of brute force.
    pub enable_item_neighbor_index: bool,
    pub enable_user_neighbor_index: bool,
    pub item_neighbor_index_recall: f32,
    pub item_neighbor_index_fit_epoch: usize,
    pub user_neighbor_index_recall: f32,
    pub user_neighbor_index_fit_epoch: usize,
    /// Days before now during which positive feedback counts toward popularity.
    pub popular_window: u32,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            item_neighbor_type: NeighborType::default(),
            user_neighbor_type: NeighborType::default(),
            enable_item_neighbor_index: false,
            enable_user_neighbor_index: false,
            item_neighbor_index_recall: 0.8,
            item_neighbor_index_fit_epoch: 3,
            user_neighbor_index_recall: 0.8,
            user_neighbor_index_fit_epoch: 3,
            popular_window: 180,
        }
    }
}

impl Config {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            database: DatabaseConfig {
                positive_feedback_types: env_list("DATABASE_POSITIVE_FEEDBACK_TYPES"),
                read_feedback_types: env_list("DATABASE_READ_FEEDBACK_TYPES"),
                item_ttl: env_parse("DATABASE_ITEM_TTL", defaults.database.item_ttl),
                positive_feedback_ttl: env_parse(
                    "DATABASE_POSITIVE_FEEDBACK_TTL",
                    defaults.database.positive_feedback_ttl,
                ),
                cache_size: env_parse("DATABASE_CACHE_SIZE", defaults.database.cache_size),
            },
            master: MasterConfig {
                num_jobs: env_parse("MASTER_NUM_JOBS", defaults.master.num_jobs),
            },
            recommend: RecommendConfig {
                item_neighbor_type: env_parse(
                    "RECOMMEND_ITEM_NEIGHBOR_TYPE",
                    defaults.recommend.item_neighbor_type,
                ),
                user_neighbor_type: env_parse(
                    "RECOMMEND_USER_NEIGHBOR_TYPE",
                    defaults.recommend.user_neighbor_type,
                ),
                enable_item_neighbor_index: env_parse(
                    "RECOMMEND_ENABLE_ITEM_NEIGHBOR_INDEX",
                    defaults.recommend.enable_item_neighbor_index,
                ),
                enable_user_neighbor_index: env_parse(
                    "RECOMMEND_ENABLE_USER_NEIGHBOR_INDEX",
                    defaults.recommend.enable_user_neighbor_index,
                ),
                item_neighbor_index_recall: env_parse(
                    "RECOMMEND_ITEM_NEIGHBOR_INDEX_RECALL",
                    defaults.recommend.item_neighbor_index_recall,
                ),
                item_neighbor_index_fit_epoch: env_parse(
                    "RECOMMEND_ITEM_NEIGHBOR_INDEX_FIT_EPOCH",
                    defaults.recommend.item_neighbor_index_fit_epoch,
                ),
                user_neighbor_index_recall: env_parse(
                    "RECOMMEND_USER_NEIGHBOR_INDEX_RECALL",
                    defaults.recommend.user_neighbor_index_recall,
                ),
                user_neighbor_index_fit_epoch: env_parse(
                    "RECOMMEND_USER_NEIGHBOR_INDEX_FIT_EPOCH",
                    defaults.recommend.user_neighbor_index_fit_epoch,
                ),
                popular_window: env_parse(
                    "RECOMMEND_POPULAR_WINDOW",
                    defaults.recommend.popular_window,
                ),
            },
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
