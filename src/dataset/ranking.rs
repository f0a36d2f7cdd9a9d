//! In-memory dataset for collaborative filtering, read-mostly after build.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::index::{MapIndex, NOT_ID};

#[derive(Debug, Clone, Default)]
pub struct RankingDataset {
    pub user_index: MapIndex,
    pub item_index: MapIndex,
    /// Sorted ascending after build.
    pub user_labels: Vec<Vec<i32>>,
    pub item_labels: Vec<Vec<i32>>,
    /// Items each user gave positive feedback to, sorted ascending after build.
    pub user_feedback: Vec<Vec<i32>>,
    /// Users who gave positive feedback to each item, sorted ascending after build.
    pub item_feedback: Vec<Vec<i32>>,
    pub item_categories: Vec<Vec<String>>,
    pub category_set: BTreeSet<String>,
    /// Hidden items never appear as neighbor candidates or in popularity.
    pub hidden_items: Vec<bool>,
    pub num_user_labels: i32,
    pub num_item_labels: i32,
    feedback_count: usize,
}

impl RankingDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&mut self, user_id: &str) -> i32 {
        let index = self.user_index.add(user_id);
        if self.user_labels.len() == index as usize {
            self.user_labels.push(Vec::new());
            self.user_feedback.push(Vec::new());
        }
        index
    }

    pub fn add_item(&mut self, item_id: &str) -> i32 {
        let index = self.item_index.add(item_id);
        if self.item_labels.len() == index as usize {
            self.item_labels.push(Vec::new());
            self.item_feedback.push(Vec::new());
            self.item_categories.push(Vec::new());
            self.hidden_items.push(false);
        }
        index
    }

    /// Record one positive feedback edge. With `insert_new` unset, events
    /// referring to unknown users or items are dropped.
    pub fn add_feedback(&mut self, user_id: &str, item_id: &str, insert_new: bool) {
        if insert_new {
            self.add_user(user_id);
            self.add_item(item_id);
        }
        let user_index = self.user_index.to_number(user_id);
        let item_index = self.item_index.to_number(item_id);
        if user_index != NOT_ID && item_index != NOT_ID {
            self.user_feedback[user_index as usize].push(item_index);
            self.item_feedback[item_index as usize].push(user_index);
            self.feedback_count += 1;
        }
    }

    pub fn user_count(&self) -> usize {
        self.user_index.len() as usize
    }

    pub fn item_count(&self) -> usize {
        self.item_index.len() as usize
    }

    pub fn count(&self) -> usize {
        self.feedback_count
    }

    /// Restore the sorted-ascending invariant on label and feedback lists.
    pub fn sort_lists(&mut self) {
        for labels in &mut self.user_labels {
            labels.sort_unstable();
        }
        for labels in &mut self.item_labels {
            labels.sort_unstable();
        }
        for feedback in &mut self.user_feedback {
            feedback.sort_unstable();
        }
        for feedback in &mut self.item_feedback {
            feedback.sort_unstable();
        }
    }

    /// Split into train and test sets. Each feedback edge lands in the test
    /// set with probability `test_ratio`; a non-positive ratio keeps the full
    /// dataset as train with an empty test set.
    pub fn split(self, test_ratio: f64, seed: u64) -> (Arc<Self>, Arc<Self>) {
        let mut test = Self {
            user_index: self.user_index.clone(),
            item_index: self.item_index.clone(),
            user_labels: self.user_labels.clone(),
            item_labels: self.item_labels.clone(),
            user_feedback: vec![Vec::new(); self.user_count()],
            item_feedback: vec![Vec::new(); self.item_count()],
            item_categories: self.item_categories.clone(),
            category_set: self.category_set.clone(),
            hidden_items: self.hidden_items.clone(),
            num_user_labels: self.num_user_labels,
            num_item_labels: self.num_item_labels,
            feedback_count: 0,
        };
        if test_ratio <= 0.0 {
            return (Arc::new(self), Arc::new(test));
        }

        let mut train = test.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        for (user, items) in self.user_feedback.iter().enumerate() {
            for &item in items {
                let target = if rng.gen::<f64>() < test_ratio {
                    &mut test
                } else {
                    &mut train
                };
                target.user_feedback[user].push(item);
                target.item_feedback[item as usize].push(user as i32);
                target.feedback_count += 1;
            }
        }
        train.sort_lists();
        test.sort_lists();
        (Arc::new(train), Arc::new(test))
    }
}
