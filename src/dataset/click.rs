//! Click-through dataset: parallel arrays of labeled user/item rows.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ClickDataset {
    /// Label vectors shared with the ranking dataset, indexed by user/item.
    pub user_features: Arc<Vec<Vec<i32>>>,
    pub item_features: Arc<Vec<Vec<i32>>>,
    pub num_users: usize,
    pub num_items: usize,
    pub num_user_labels: i32,
    pub num_item_labels: i32,

    pub users: Vec<i32>,
    pub items: Vec<i32>,
    /// `1/sqrt(|user features| + |item features|)` per row.
    pub norm_values: Vec<f32>,
    /// `+1` for positive rows, `-1` for negative rows.
    pub targets: Vec<i8>,
    pub positive_count: usize,
    pub negative_count: usize,
}

impl ClickDataset {
    pub fn user_count(&self) -> usize {
        self.num_users
    }

    pub fn item_count(&self) -> usize {
        self.num_items
    }

    pub fn count(&self) -> usize {
        self.targets.len()
    }

    pub fn push_row(&mut self, user: i32, item: i32, target: i8) {
        let norm = 1.0
            / ((self.user_features[user as usize].len() + self.item_features[item as usize].len())
                as f32)
                .sqrt();
        self.users.push(user);
        self.items.push(item);
        self.norm_values.push(norm);
        self.targets.push(target);
        if target > 0 {
            self.positive_count += 1;
        } else {
            self.negative_count += 1;
        }
    }

    /// Split rows into train and test sets; feature tables are shared.
    pub fn split(self, test_ratio: f64, seed: u64) -> (Arc<Self>, Arc<Self>) {
        let mut test = Self {
            user_features: self.user_features.clone(),
            item_features: self.item_features.clone(),
            num_users: self.num_users,
            num_items: self.num_items,
            num_user_labels: self.num_user_labels,
            num_item_labels: self.num_item_labels,
            ..Default::default()
        };
        if test_ratio <= 0.0 {
            return (Arc::new(self), Arc::new(test));
        }

        let mut train = test.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        for row in 0..self.count() {
            let target = if rng.gen::<f64>() < test_ratio {
                &mut test
            } else {
                &mut train
            };
            target.users.push(self.users[row]);
            target.items.push(self.items[row]);
            target.norm_values.push(self.norm_values[row]);
            target.targets.push(self.targets[row]);
            if self.targets[row] > 0 {
                target.positive_count += 1;
            } else {
                target.negative_count += 1;
            }
        }
        (Arc::new(train), Arc::new(test))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_dataset() -> ClickDataset {
        let mut dataset = ClickDataset {
            user_features: Arc::new(vec![vec![0], vec![0, 1]]),
            item_features: Arc::new(vec![vec![2], vec![], vec![2, 3]]),
            num_users: 2,
            num_items: 3,
            num_user_labels: 2,
            num_item_labels: 4,
            ..Default::default()
        };
        dataset.push_row(0, 0, 1);
        dataset.push_row(0, 1, -1);
        dataset.push_row(1, 2, 1);
        dataset
    }

    #[test]
    fn test_norm_values() {
        let dataset = small_dataset();
        assert!((dataset.norm_values[0] - 1.0 / 2.0_f32.sqrt()).abs() < 1e-6);
        assert!((dataset.norm_values[1] - 1.0).abs() < 1e-6);
        assert!((dataset.norm_values[2] - 1.0 / 4.0_f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_counts() {
        let dataset = small_dataset();
        assert_eq!(dataset.count(), 3);
        assert_eq!(dataset.positive_count, 2);
        assert_eq!(dataset.negative_count, 1);
    }

    #[test]
    fn test_split_shares_features() {
        let dataset = small_dataset();
        let (train, test) = dataset.split(0.5, 7);
        assert_eq!(train.count() + test.count(), 3);
        assert!(Arc::ptr_eq(&train.user_features, &test.user_features));
        assert_eq!(
            train.positive_count + test.positive_count,
            2
        );
    }

    #[test]
    fn test_split_zero() {
        let dataset = small_dataset();
        let (train, test) = dataset.split(0.0, 0);
        assert_eq!(train.count(), 3);
        assert_eq!(test.count(), 0);
    }
}
