//! In-memory data store, the reference backend used by tests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use super::{BatchStream, DataStore, Feedback, Item, Measurement, User};
use crate::error::Result;

#[derive(Default)]
struct Rows {
    users: Vec<User>,
    items: Vec<Item>,
    feedback: Vec<Feedback>,
    measurements: Vec<Measurement>,
}

#[derive(Default)]
pub struct MemoryDataStore {
    rows: Mutex<Rows>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.rows.lock().unwrap().users.push(user);
    }

    pub fn insert_item(&self, item: Item) {
        self.rows.lock().unwrap().items.push(item);
    }

    pub fn insert_feedback(&self, feedback: Feedback) {
        self.rows.lock().unwrap().feedback.push(feedback);
    }
}

fn stream_batches<T: Send + 'static>(rows: Vec<T>, batch_size: usize) -> BatchStream<T> {
    let (batch_tx, error_tx, stream) = BatchStream::channel(16);
    tokio::spawn(async move {
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<T> = rows.by_ref().take(batch_size.max(1)).collect();
            if batch_tx.send(batch).await.is_err() {
                return;
            }
        }
        let _ = error_tx.send(Ok(()));
    });
    stream
}

fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

#[async_trait]
impl DataStore for MemoryDataStore {
    fn user_stream(&self, batch_size: usize) -> BatchStream<User> {
        let users = self.rows.lock().unwrap().users.clone();
        stream_batches(users, batch_size)
    }

    fn item_stream(&self, batch_size: usize, since: Option<DateTime<Utc>>) -> BatchStream<Item> {
        let items: Vec<Item> = self
            .rows
            .lock()
            .unwrap()
            .items
            .iter()
            .filter(|item| match since {
                Some(bound) => item.timestamp.map(|ts| ts >= bound).unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        stream_batches(items, batch_size)
    }

    fn feedback_stream(
        &self,
        batch_size: usize,
        since: Option<DateTime<Utc>>,
        types: &[String],
    ) -> BatchStream<Feedback> {
        let feedback: Vec<Feedback> = self
            .rows
            .lock()
            .unwrap()
            .feedback
            .iter()
            .filter(|f| types.contains(&f.feedback_type))
            .filter(|f| since.map(|bound| f.timestamp >= bound).unwrap_or(true))
            .cloned()
            .collect();
        stream_batches(feedback, batch_size)
    }

    async fn click_through_rate(
        &self,
        date: NaiveDate,
        positive_types: &[String],
        read_types: &[String],
    ) -> Result<f64> {
        let (start, end) = day_bounds(date);
        let rows = self.rows.lock().unwrap();
        let mut positive: HashSet<(String, String)> = HashSet::new();
        let mut exposed: HashSet<(String, String)> = HashSet::new();
        for f in &rows.feedback {
            if f.timestamp < start || f.timestamp >= end {
                continue;
            }
            let pair = (f.user_id.clone(), f.item_id.clone());
            if positive_types.contains(&f.feedback_type) {
                positive.insert(pair.clone());
                exposed.insert(pair);
            } else if read_types.contains(&f.feedback_type) {
                exposed.insert(pair);
            }
        }
        if exposed.is_empty() {
            return Ok(0.0);
        }
        Ok(positive.len() as f64 / exposed.len() as f64)
    }

    async fn insert_measurement(&self, measurement: Measurement) -> Result<()> {
        self.rows.lock().unwrap().measurements.push(measurement);
        Ok(())
    }

    async fn measurements(&self, name: &str, n: usize) -> Result<Vec<Measurement>> {
        let rows = self.rows.lock().unwrap();
        let mut found: Vec<Measurement> = rows
            .measurements
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(n);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feedback(kind: &str, user: &str, item: &str, ts: DateTime<Utc>) -> Feedback {
        Feedback {
            feedback_type: kind.to_string(),
            user_id: user.to_string(),
            item_id: item.to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_user_stream_batches() {
        let store = MemoryDataStore::new();
        for i in 0..5 {
            store.insert_user(User {
                user_id: format!("u{}", i),
                labels: vec![],
            });
        }
        let mut stream = store.user_stream(2);
        let mut total = 0;
        let mut batches = 0;
        while let Some(batch) = stream.batches.recv().await {
            total += batch.len();
            batches += 1;
        }
        stream.terminal().await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(batches, 3);
    }

    #[tokio::test]
    async fn test_item_stream_time_bound() {
        let store = MemoryDataStore::new();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.insert_item(Item {
            item_id: "old".into(),
            timestamp: Some(old),
            ..Default::default()
        });
        store.insert_item(Item {
            item_id: "new".into(),
            timestamp: Some(new),
            ..Default::default()
        });
        store.insert_item(Item {
            item_id: "untimed".into(),
            timestamp: None,
            ..Default::default()
        });
        let mut stream = store.item_stream(10, Some(new));
        let mut seen = Vec::new();
        while let Some(batch) = stream.batches.recv().await {
            seen.extend(batch.into_iter().map(|i| i.item_id));
        }
        stream.terminal().await.unwrap();
        assert_eq!(seen, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_click_through_rate() {
        let store = MemoryDataStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let at = day.and_hms_opt(12, 0, 0).unwrap().and_utc();
        store.insert_feedback(feedback("read", "u1", "i1", at));
        store.insert_feedback(feedback("read", "u1", "i2", at));
        store.insert_feedback(feedback("star", "u1", "i2", at));
        store.insert_feedback(feedback("star", "u1", "i3", at));
        let rate = store
            .click_through_rate(day, &["star".to_string()], &["read".to_string()])
            .await
            .unwrap();
        // 2 positive pairs out of 3 exposed pairs.
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_measurements_latest_first() {
        let store = MemoryDataStore::new();
        for day in 1..=5 {
            store
                .insert_measurement(Measurement {
                    name: "ctr".into(),
                    timestamp: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
                    value: day as f32,
                })
                .await
                .unwrap();
        }
        let found = store.measurements("ctr", 3).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].value, 5.0);
        assert_eq!(found[2].value, 3.0);
    }
}
