//! Daily click-through rate aggregation over the last 30 days.

use chrono::{Duration, NaiveTime, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tracing::info;

use super::Master;
use crate::error::Result;
use crate::jobs::monitor::TASK_ANALYZE;
use crate::storage::cache::key;
use crate::storage::data::{DataStore, Measurement};

pub const POSITIVE_FEEDBACK_RATE: &str = "PositiveFeedbackRate";

impl Master {
    /// For each configured positive feedback type, compute the aggregated
    /// click-through rate of each of the last 30 days (excluding today) and
    /// persist it as a measurement. Days already measured are skipped.
    pub async fn run_analyze_task(&self) -> Result<()> {
        let _guard = self.task_scheduler.lock(TASK_ANALYZE).await;
        info!("start analyzing click-through-rate");
        let feedback_types = self.config.database.positive_feedback_types.clone();
        self.task_monitor
            .start(TASK_ANALYZE, 30 * feedback_types.len());
        for (type_index, feedback_type) in feedback_types.iter().enumerate() {
            let measurement = key(&[POSITIVE_FEEDBACK_RATE, feedback_type]);
            let existing = self.data_store.measurements(&measurement, 30).await?;
            let existed: HashSet<_> = existing
                .iter()
                .map(|m| m.timestamp.date_naive())
                .collect();
            for day in 1..=30usize {
                let date = (Utc::now() - Duration::days(day as i64)).date_naive();
                if !existed.contains(&date) {
                    let start = Instant::now();
                    let rate = self
                        .data_store
                        .click_through_rate(
                            date,
                            std::slice::from_ref(feedback_type),
                            &self.config.database.read_feedback_types,
                        )
                        .await?;
                    self.data_store
                        .insert_measurement(Measurement {
                            name: measurement.clone(),
                            timestamp: date.and_time(NaiveTime::MIN).and_utc(),
                            value: rate as f32,
                        })
                        .await?;
                    info!(
                        date = %date,
                        time_used = ?start.elapsed(),
                        positive_feedback_type = %feedback_type,
                        positive_feedback_rate = rate,
                        "update click through rate"
                    );
                }
                self.task_monitor
                    .update(TASK_ANALYZE, day + type_index * 30);
            }
        }
        info!("complete analyzing click-through-rate");
        self.task_monitor.finish(TASK_ANALYZE);
        Ok(())
    }
}
