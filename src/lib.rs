//! Offline master pipeline of the recommender platform.
//!
//! Periodically transforms raw interaction data (users, items, feedback
//! events) into the derived artifacts consumed by the online serving tier:
//! popularity and recency lists, item-to-item and user-to-user neighbor
//! lists, and two trained models (collaborative filtering and click-through
//! rate prediction) with hyper-parameter search.

pub mod config;
pub mod dataset;
pub mod error;
pub mod heap;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod search;
pub mod storage;

pub use error::{AppError, Result};
