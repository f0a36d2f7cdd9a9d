//! In-memory cache backend for tests and single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use super::{key, CacheStore, Scored};
use crate::error::{AppError, Result};

/// Sorted set dual-indexed by score and member, matching Redis ordering:
/// members sort by `(score, member)`, ties broken lexicographically.
#[derive(Debug, Default)]
struct SortedSet {
    tree: BTreeMap<(OrderedFloat<f64>, String), ()>,
    scores: HashMap<String, f64>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.tree.remove(&(OrderedFloat(old), member.to_string()));
        }
        self.tree.insert((OrderedFloat(score), member.to_string()), ());
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.tree.remove(&(OrderedFloat(old), member.to_string()));
        }
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Default)]
struct Tables {
    scalars: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    sorted: HashMap<String, SortedSet>,
}

/// Cache store backed by process memory.
#[derive(Default)]
pub struct MemoryCache {
    tables: Mutex<Tables>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_string(&self, prefix: &str, name: &str) -> Result<String> {
        let composed = key(&[prefix, name]);
        let tables = self.tables.lock().unwrap();
        tables
            .scalars
            .get(&composed)
            .cloned()
            .ok_or(AppError::NotFound(composed))
    }

    async fn set_string(&self, prefix: &str, name: &str, value: &str) -> Result<()> {
        let composed = key(&[prefix, name]);
        let mut tables = self.tables.lock().unwrap();
        tables.scalars.insert(composed, value.to_string());
        Ok(())
    }

    async fn get_int(&self, prefix: &str, name: &str) -> Result<i64> {
        let value = self.get_string(prefix, name).await?;
        value
            .parse()
            .map_err(|_| AppError::Serialization(format!("not an integer: {}", value)))
    }

    async fn set_int(&self, prefix: &str, name: &str, value: i64) -> Result<()> {
        self.set_string(prefix, name, &value.to_string()).await
    }

    async fn incr_int(&self, prefix: &str, name: &str) -> Result<()> {
        let composed = key(&[prefix, name]);
        let mut tables = self.tables.lock().unwrap();
        let entry = tables.scalars.entry(composed).or_insert_with(|| "0".to_string());
        let current: i64 = entry
            .parse()
            .map_err(|_| AppError::Serialization(format!("not an integer: {}", entry)))?;
        *entry = (current + 1).to_string();
        Ok(())
    }

    async fn get_time(&self, prefix: &str, name: &str) -> Result<DateTime<Utc>> {
        let value = self.get_string(prefix, name).await?;
        let seconds: i64 = value
            .parse()
            .map_err(|_| AppError::Serialization(format!("not a timestamp: {}", value)))?;
        DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| AppError::Serialization(format!("timestamp out of range: {}", seconds)))
    }

    async fn set_time(&self, prefix: &str, name: &str, value: DateTime<Utc>) -> Result<()> {
        self.set_string(prefix, name, &value.timestamp().to_string())
            .await
    }

    async fn delete(&self, prefix: &str, name: &str) -> Result<()> {
        let composed = key(&[prefix, name]);
        let mut tables = self.tables.lock().unwrap();
        tables.scalars.remove(&composed);
        tables.sets.remove(&composed);
        tables.sorted.remove(&composed);
        Ok(())
    }

    async fn exists(&self, prefix: &str, names: &[&str]) -> Result<Vec<i32>> {
        let tables = self.tables.lock().unwrap();
        Ok(names
            .iter()
            .map(|name| {
                let composed = key(&[prefix, name]);
                let found = tables.scalars.contains_key(&composed)
                    || tables.sets.contains_key(&composed)
                    || tables.sorted.contains_key(&composed);
                i32::from(found)
            })
            .collect())
    }

    async fn get_set(&self, key: &str) -> Result<Vec<String>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_set(&self, key: &str, members: &[&str]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let set = members.iter().map(|m| m.to_string()).collect();
        tables.sets.insert(key.to_string(), set);
        Ok(())
    }

    async fn add_set(&self, key: &str, members: &[&str]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let set = tables.sets.entry(key.to_string()).or_default();
        for member in members {
            set.insert(member.to_string());
        }
        Ok(())
    }

    async fn rem_set(&self, key: &str, members: &[&str]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(set) = tables.sets.get_mut(key) {
            for member in members {
                set.remove(*member);
            }
        }
        Ok(())
    }

    async fn get_sorted(&self, key: &str, begin: isize, end: isize) -> Result<Vec<Scored>> {
        let tables = self.tables.lock().unwrap();
        let Some(sorted) = tables.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let len = sorted.tree.len() as isize;
        let clamp = |index: isize| -> isize {
            let translated = if index < 0 { len + index } else { index };
            translated.clamp(0, len)
        };
        let begin = clamp(begin);
        let end = if end < 0 { clamp(end) + 1 } else { (end + 1).min(len) };
        if begin >= end {
            return Ok(Vec::new());
        }
        Ok(sorted
            .tree
            .iter()
            .rev()
            .skip(begin as usize)
            .take((end - begin) as usize)
            .map(|((score, member), _)| Scored {
                id: member.clone(),
                score: score.into_inner(),
            })
            .collect())
    }

    async fn get_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<Vec<Scored>> {
        let tables = self.tables.lock().unwrap();
        let Some(sorted) = tables.sorted.get(key) else {
            return Ok(Vec::new());
        };
        Ok(sorted
            .tree
            .iter()
            .filter(|((score, _), _)| {
                let score = score.into_inner();
                score >= low && score <= high
            })
            .map(|((score, member), _)| Scored {
                id: member.clone(),
                score: score.into_inner(),
            })
            .collect())
    }

    async fn get_sorted_score(&self, key: &str, member: &str) -> Result<f64> {
        let tables = self.tables.lock().unwrap();
        tables
            .sorted
            .get(key)
            .and_then(|sorted| sorted.scores.get(member).copied())
            .ok_or_else(|| AppError::NotFound(format!("{}/{}", key, member)))
    }

    async fn add_sorted(&self, key: &str, scored: &[Scored]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let sorted = tables.sorted.entry(key.to_string()).or_default();
        for entry in scored {
            sorted.insert(&entry.id, entry.score);
        }
        Ok(())
    }

    async fn set_sorted(&self, key: &str, scored: &[Scored]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let mut sorted = SortedSet::default();
        for entry in scored {
            sorted.insert(&entry.id, entry.score);
        }
        tables.sorted.insert(key.to_string(), sorted);
        Ok(())
    }

    async fn incr_sorted(&self, key: &str, member: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let sorted = tables.sorted.entry(key.to_string()).or_default();
        let score = sorted.scores.get(member).copied().unwrap_or(0.0) + 1.0;
        sorted.insert(member, score);
        Ok(())
    }

    async fn rem_sorted(&self, key: &str, member: &str) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(sorted) = tables.sorted.get_mut(key) {
            sorted.remove(member);
        }
        Ok(())
    }

    async fn rem_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(sorted) = tables.sorted.get_mut(key) {
            let doomed: Vec<String> = sorted
                .tree
                .iter()
                .filter(|((score, _), _)| {
                    let score = score.into_inner();
                    score >= low && score <= high
                })
                .map(|((_, member), _)| member.clone())
                .collect();
            for member in doomed {
                sorted.remove(&member);
            }
            if sorted.is_empty() {
                tables.sorted.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_suite;
    use super::*;

    #[tokio::test]
    async fn test_meta() {
        let store = MemoryCache::new();
        test_suite::test_meta(&store).await;
    }

    #[tokio::test]
    async fn test_set() {
        let store = MemoryCache::new();
        test_suite::test_set(&store).await;
    }

    #[tokio::test]
    async fn test_sort() {
        let store = MemoryCache::new();
        test_suite::test_sort(&store).await;
    }

    #[tokio::test]
    async fn test_descending_ties_follow_redis() {
        let store = MemoryCache::new();
        store
            .set_sorted(
                "ties",
                &[
                    Scored { id: "a".into(), score: 1.0 },
                    Scored { id: "b".into(), score: 1.0 },
                ],
            )
            .await
            .unwrap();
        let items = store.get_sorted("ties", 0, -1).await.unwrap();
        // Reverse range orders equal scores by member descending.
        assert_eq!(items[0].id, "b");
        assert_eq!(items[1].id, "a");
    }
}
