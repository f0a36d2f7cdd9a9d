//! Redis cache backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

use super::{key, CacheStore, Scored};
use crate::error::{AppError, Result};

pub struct RedisCache {
    client: Client,
}

impl RedisCache {
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(url)?,
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get_string(&self, prefix: &str, name: &str) -> Result<String> {
        let composed = key(&[prefix, name]);
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(&composed).await?;
        value.ok_or(AppError::NotFound(composed))
    }

    async fn set_string(&self, prefix: &str, name: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key(&[prefix, name]), value).await?;
        Ok(())
    }

    async fn get_int(&self, prefix: &str, name: &str) -> Result<i64> {
        let composed = key(&[prefix, name]);
        let mut conn = self.conn().await?;
        let value: Option<i64> = conn.get(&composed).await?;
        value.ok_or(AppError::NotFound(composed))
    }

    async fn set_int(&self, prefix: &str, name: &str, value: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key(&[prefix, name]), value).await?;
        Ok(())
    }

    async fn incr_int(&self, prefix: &str, name: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.incr(key(&[prefix, name]), 1i64).await?;
        Ok(())
    }

    async fn get_time(&self, prefix: &str, name: &str) -> Result<DateTime<Utc>> {
        let seconds = self.get_int(prefix, name).await?;
        DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| AppError::Serialization(format!("timestamp out of range: {}", seconds)))
    }

    async fn set_time(&self, prefix: &str, name: &str, value: DateTime<Utc>) -> Result<()> {
        self.set_int(prefix, name, value.timestamp()).await
    }

    async fn delete(&self, prefix: &str, name: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key(&[prefix, name])).await?;
        Ok(())
    }

    async fn exists(&self, prefix: &str, names: &[&str]) -> Result<Vec<i32>> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for name in names {
            pipe.exists(key(&[prefix, name]));
        }
        let flags: Vec<i32> = pipe.query_async(&mut conn).await?;
        Ok(flags)
    }

    async fn get_set(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn set_set(&self, key: &str, members: &[&str]) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.sadd(key, members).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_set(&self, key: &str, members: &[&str]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(key, members).await?;
        Ok(())
    }

    async fn rem_set(&self, key: &str, members: &[&str]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.srem(key, members).await?;
        Ok(())
    }

    async fn get_sorted(&self, key: &str, begin: isize, end: isize) -> Result<Vec<Scored>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = conn.zrevrange_withscores(key, begin, end).await?;
        Ok(members
            .into_iter()
            .map(|(id, score)| Scored { id, score })
            .collect())
    }

    async fn get_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<Vec<Scored>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, low, high).await?;
        Ok(members
            .into_iter()
            .map(|(id, score)| Scored { id, score })
            .collect())
    }

    async fn get_sorted_score(&self, key: &str, member: &str) -> Result<f64> {
        let mut conn = self.conn().await?;
        let score: Option<f64> = conn.zscore(key, member).await?;
        score.ok_or_else(|| AppError::NotFound(format!("{}/{}", key, member)))
    }

    async fn add_sorted(&self, key: &str, scored: &[Scored]) -> Result<()> {
        if scored.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let items: Vec<(f64, &str)> = scored.iter().map(|s| (s.score, s.id.as_str())).collect();
        let _: () = conn.zadd_multiple(key, &items).await?;
        Ok(())
    }

    async fn set_sorted(&self, key: &str, scored: &[Scored]) -> Result<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !scored.is_empty() {
            let items: Vec<(f64, &str)> = scored.iter().map(|s| (s.score, s.id.as_str())).collect();
            pipe.zadd_multiple(key, &items).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr_sorted(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zincr(key, member, 1.0).await?;
        Ok(())
    }

    async fn rem_sorted(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn rem_sorted_by_score(&self, key: &str, low: f64, high: f64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zrembyscore(key, low, high).await?;
        Ok(())
    }
}
