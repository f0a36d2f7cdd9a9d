//! Contract of the raw-event data store consumed by the master pipeline.
//!
//! Users, items and feedback are pulled through batched streams with a
//! separate terminal error channel: the consumer drains the data channel
//! fully before reading the error, so trailing batches are never dropped.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{AppError, Result};

pub mod memory;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub is_hidden: bool,
    pub categories: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
}

/// A `(user, item, type, timestamp)` interaction event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub feedback_type: String,
    pub user_id: String,
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A named scalar aggregated offline, e.g. a daily click-through rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f32,
}

/// Batched stream plus terminal error channel.
pub struct BatchStream<T> {
    pub batches: mpsc::Receiver<Vec<T>>,
    error: oneshot::Receiver<Result<()>>,
}

impl<T> BatchStream<T> {
    /// Create the producer halves and the stream handle.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Vec<T>>, oneshot::Sender<Result<()>>, Self) {
        let (batch_tx, batch_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = oneshot::channel();
        (
            batch_tx,
            error_tx,
            Self {
                batches: batch_rx,
                error: error_rx,
            },
        )
    }

    /// Read the terminal result. Call only after `batches` is exhausted.
    pub async fn terminal(self) -> Result<()> {
        match self.error.await {
            Ok(result) => result,
            Err(_) => Err(AppError::DataStore(
                "stream terminated without a result".to_string(),
            )),
        }
    }
}

/// Common interface for data store backends.
#[async_trait]
pub trait DataStore: Send + Sync {
    fn user_stream(&self, batch_size: usize) -> BatchStream<User>;

    /// Items are emitted only if their timestamp is at or after `since`,
    /// when set; items without a timestamp are dropped by the bound.
    fn item_stream(&self, batch_size: usize, since: Option<DateTime<Utc>>) -> BatchStream<Item>;

    /// Feedback filtered by type and timestamp lower bound.
    fn feedback_stream(
        &self,
        batch_size: usize,
        since: Option<DateTime<Utc>>,
        types: &[String],
    ) -> BatchStream<Feedback>;

    /// Aggregated click-through rate for one day.
    async fn click_through_rate(
        &self,
        date: NaiveDate,
        positive_types: &[String],
        read_types: &[String],
    ) -> Result<f64>;

    async fn insert_measurement(&self, measurement: Measurement) -> Result<()>;

    /// The `n` most recent measurements under `name`, newest first.
    async fn measurements(&self, name: &str, n: usize) -> Result<Vec<Measurement>>;
}
